//! Khatm reading circles - coordinate a shared 30-part reading across devices

pub mod circle;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod service;
pub mod store;
pub mod websocket;

use std::sync::Arc;

use crate::config::CircleSettings;
use crate::service::CircleService;
use crate::store::CircleStore;

/// Application state shared across handlers
pub struct AppState {
    pub service: CircleService,
}

impl AppState {
    pub fn new(store: Arc<dyn CircleStore>, settings: CircleSettings) -> Arc<Self> {
        Arc::new(Self {
            service: CircleService::new(store, settings),
        })
    }
}
