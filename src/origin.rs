use axum::http::{
    HeaderMap, HeaderName,
    header::{HOST, ORIGIN, REFERER},
};
use reqwest::Url;

use crate::error::ApiError;

// scheme://host[:port] of an absolute http(s) URL
fn origin_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

/// Checks where an analytics request came from.
///
/// With a configured site origin, a request whose `Origin` (or, failing
/// that, `Referer`) points somewhere else is refused. Requests carrying
/// neither header pass. Without a configured origin the check only logs
/// origins that do not mention the `Host` header.
pub fn check_origin(headers: &HeaderMap, site_origin: Option<&str>) -> Result<(), ApiError> {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    let Some(site_origin) = site_origin else {
        if let (Some(origin), Some(host)) = (header(ORIGIN), header(HOST)) {
            if !origin.contains(host) {
                tracing::warn!(origin, host, "analytics request from unexpected origin");
            }
        }
        return Ok(());
    };

    let expected = origin_of(site_origin).ok_or_else(|| {
        tracing::error!(site_origin, "SITE_ORIGIN is not an absolute http(s) URL");
        ApiError::Misconfigured
    })?;

    let claimed = match (header(ORIGIN), header(REFERER)) {
        (Some(origin), _) => origin,
        (None, Some(referer)) => referer,
        (None, None) => return Ok(()),
    };

    if origin_of(claimed).as_deref() == Some(expected.as_str()) {
        Ok(())
    } else {
        tracing::warn!(claimed, expected = %expected, "rejected analytics request from foreign origin");
        Err(ApiError::ForbiddenOrigin)
    }
}
