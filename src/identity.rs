use axum::http::{HeaderMap, header::COOKIE};
use uuid::Uuid;

const CLIENT_ID_COOKIE: &str = "ga_client_id";
const GA_COOKIE: &str = "_ga";
const SESSION_COOKIE: &str = "ga_session_id";
// Cookie values longer than this are ignored
const MAX_ID_LEN: usize = 128;

// Value of the first cookie called `name`
fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty() && value.len() <= MAX_ID_LEN)
}

// `_ga` looks like GA1.<n>.<client id>
fn ga_cookie_client_id(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("GA1.")?;
    let (depth, id) = rest.split_once('.')?;
    if depth.is_empty() || !depth.bytes().all(|b| b.is_ascii_digit()) || id.is_empty() {
        return None;
    }
    Some(id)
}

/// Analytics client id for the visitor.
///
/// Prefers the first-party `ga_client_id` cookie, then the id embedded in a
/// `_ga` cookie, and otherwise makes a new `<unix millis>.<random>` id.
pub fn client_id(headers: &HeaderMap) -> String {
    if let Some(id) = cookie(headers, CLIENT_ID_COOKIE) {
        return id.to_string();
    }
    if let Some(id) = cookie(headers, GA_COOKIE).and_then(ga_cookie_client_id) {
        return id.to_string();
    }
    generate_client_id()
}

pub fn session_id(headers: &HeaderMap) -> String {
    cookie(headers, SESSION_COOKIE)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn generate_client_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}.{}", chrono::Utc::now().timestamp_millis(), &random[..13])
}
