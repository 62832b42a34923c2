use crate::dispatcher::Dispatcher;
use crate::sources::{Clock, RandomSource};
use crate::store::PipelineStore;
use moka::future::Cache;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub dispatcher: Dispatcher,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub branch_filter: Option<Regex>,
    pub cache: Cache<String, JsonValue>,
}
