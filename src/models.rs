use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_EVENT_NAME_LEN: usize = 100;
pub const MAX_FIELD_LEN: usize = 500;
pub const MAX_CUSTOM_PARAMS: usize = 20;
pub const MAX_PARAM_KEY_LEN: usize = 100;
pub const DEFAULT_ENGAGEMENT_TIME_MSEC: u64 = 100;

// Event posted by the site.
// Fields are kept as raw JSON so that wrong types are reported per field.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    #[serde(default)]
    pub event_name: Option<Value>,
    #[serde(default)]
    pub page_location: Option<Value>,
    #[serde(default)]
    pub page_title: Option<Value>,
    #[serde(default)]
    pub referrer: Option<Value>,
    #[serde(default)]
    pub custom_params: Option<Value>,
}

// Event after validation
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub event_name: String,
    pub page_location: Option<String>,
    pub page_title: Option<String>,
    pub referrer: Option<String>,
    pub custom_params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid eventName")]
    EventName,
    #[error("Invalid {0}")]
    Field(&'static str),
    #[error("Invalid customParams: must be a plain object")]
    ParamsNotObject,
    #[error("Invalid customParams: too many keys (max 20)")]
    TooManyParams,
    #[error("Invalid customParams: key too long")]
    ParamKeyTooLong,
    #[error("Invalid customParams: values must be string/number/boolean/null")]
    ParamValueType,
    #[error("Invalid customParams: string value too long")]
    ParamValueTooLong,
}

impl EventRequest {
    pub fn validate(self) -> Result<AnalyticsEvent, ValidationError> {
        let event_name = match self.event_name {
            Some(Value::String(name)) if !name.is_empty() && name.chars().count() <= MAX_EVENT_NAME_LEN => name,
            _ => return Err(ValidationError::EventName),
        };

        Ok(AnalyticsEvent {
            event_name,
            page_location: optional_text(self.page_location, "pageLocation")?,
            page_title: optional_text(self.page_title, "pageTitle")?,
            referrer: optional_text(self.referrer, "referrer")?,
            custom_params: custom_params(self.custom_params)?,
        })
    }
}

// Missing, null and "" all mean "not provided"
fn optional_text(value: Option<Value>, field: &'static str) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) if s.chars().count() <= MAX_FIELD_LEN => Ok(Some(s)),
        Some(_) => Err(ValidationError::Field(field)),
    }
}

fn custom_params(value: Option<Value>) -> Result<Map<String, Value>, ValidationError> {
    let params = match value {
        None | Some(Value::Null) => return Ok(Map::new()),
        Some(Value::Object(params)) => params,
        Some(_) => return Err(ValidationError::ParamsNotObject),
    };

    if params.len() > MAX_CUSTOM_PARAMS {
        return Err(ValidationError::TooManyParams);
    }
    for (key, value) in &params {
        if key.chars().count() > MAX_PARAM_KEY_LEN {
            return Err(ValidationError::ParamKeyTooLong);
        }
        match value {
            Value::String(s) if s.chars().count() > MAX_FIELD_LEN => {
                return Err(ValidationError::ParamValueTooLong);
            }
            Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => {}
            Value::Array(_) | Value::Object(_) => return Err(ValidationError::ParamValueType),
        }
    }
    Ok(params)
}

// Everything the collector worker needs for one event
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: AnalyticsEvent,
    pub client_id: String,
    pub session_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

// Measurement Protocol request body
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectPayload {
    pub client_id: String,
    pub events: Vec<CollectEvent>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectEvent {
    pub name: String,
    pub params: Map<String, Value>,
}

impl CollectPayload {
    pub fn from_queued(queued: &QueuedEvent) -> Self {
        let event = &queued.event;

        // custom params first so the reserved fields below always win
        let mut params = event.custom_params.clone();
        let reserved = [
            ("page_location", event.page_location.as_deref()),
            ("page_title", event.page_title.as_deref()),
            ("page_referrer", event.referrer.as_deref()),
        ];
        for (name, value) in reserved {
            match value {
                Some(v) => params.insert(name.to_string(), Value::from(v)),
                None => params.remove(name),
            };
        }
        params.insert(
            "engagement_time_msec".to_string(),
            Value::from(DEFAULT_ENGAGEMENT_TIME_MSEC),
        );
        params.insert("session_id".to_string(), Value::from(queued.session_id.as_str()));

        Self {
            client_id: queued.client_id.clone(),
            events: vec![CollectEvent {
                name: event.event_name.clone(),
                params,
            }],
        }
    }
}
