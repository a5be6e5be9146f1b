use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::agent::AgentCache;
use crate::clock::Clock;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub staff: bool,
    pub superuser: bool,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub user: Option<SessionUser>,
    pub clock: Clock,
    pub agents: AgentCache,
}

impl AppState {
    pub fn new(clock: Clock) -> Self {
        Self {
            workspace: None,
            db: None,
            user: None,
            clock,
            agents: AgentCache::default(),
        }
    }
}
