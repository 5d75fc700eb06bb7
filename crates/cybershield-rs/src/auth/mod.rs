use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub owner_id: String,
}

/// Bearer token -> owner. Tokens are issued elsewhere; this only resolves them.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn from_tokens(tokens: &HashMap<String, String>) -> Self {
        let sessions = tokens
            .iter()
            .map(|(token, owner_id)| {
                (
                    token.clone(),
                    Session {
                        owner_id: owner_id.clone(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(RwLock::new(sessions)),
        }
    }

    pub async fn get(&self, token: &str) -> Option<Session> {
        self.inner.read().await.get(token).cloned()
    }
}
