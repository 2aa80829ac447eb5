use std::sync::{Arc, PoisonError, RwLock};

/// Shared credential slot. Uploads read it at the start of every attempt, so
/// a token replaced between attempts is picked up by the next one.
#[derive(Clone, Default)]
pub struct AuthStore {
    token: Arc<RwLock<Option<String>>>,
}

impl AuthStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::default();
        store.set(token);
        store
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_valid(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("authenticated", &self.is_valid())
            .finish()
    }
}
