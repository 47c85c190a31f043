use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StoreResult;

/// Identity owning the local mutation queue.
///
/// Cached document state is shared between users, but pending writes belong
/// to the user that issued them. The unauthenticated user is a valid identity
/// with its own queue.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }
}

/// Bearer token attached to outgoing stream requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub user: User,
}

pub type CredentialChangeListener = Box<dyn Fn(User) + Send + Sync + 'static>;

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the token to attach to the next request, or `None` when the
    /// current user carries no credentials.
    async fn get_token(&self) -> StoreResult<Option<AuthToken>>;

    /// Marks the cached token as rejected so the next fetch refreshes it.
    fn invalidate_token(&self);

    fn current_user(&self) -> User;

    /// Registers the listener notified on every user change. The listener is
    /// invoked immediately with the current user.
    fn set_change_listener(&self, listener: CredentialChangeListener);

    fn remove_change_listener(&self);
}

/// Provider for deployments without authentication.
#[derive(Default)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> StoreResult<Option<AuthToken>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn current_user(&self) -> User {
        User::unauthenticated()
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }

    fn remove_change_listener(&self) {}
}

/// Provider backed by a mutable user slot.
///
/// Embedders that manage sessions themselves swap the user with
/// [`StaticCredentialsProvider::set_user`], which notifies the registered
/// listener so the client can rotate its mutation queue.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: Mutex<StaticCredentialsState>,
}

#[derive(Default)]
struct StaticCredentialsState {
    user: Option<User>,
    token: Option<String>,
    listener: Option<Arc<CredentialChangeListener>>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User) -> Self {
        Self {
            state: Mutex::new(StaticCredentialsState {
                user: Some(user),
                token: None,
                listener: None,
            }),
        }
    }

    pub fn with_token(user: User, token: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(StaticCredentialsState {
                user: Some(user),
                token: Some(token.into()),
                listener: None,
            }),
        }
    }

    /// Replaces the current user and notifies the change listener.
    pub fn set_user(&self, user: User) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            state.user = Some(user.clone());
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> StoreResult<Option<AuthToken>> {
        let state = self.state.lock().unwrap();
        let user = state.user.clone().unwrap_or_else(User::unauthenticated);
        Ok(state.token.as_ref().map(|value| AuthToken {
            value: value.clone(),
            user,
        }))
    }

    fn invalidate_token(&self) {
        self.state.lock().unwrap().token = None;
    }

    fn current_user(&self) -> User {
        self.state
            .lock()
            .unwrap()
            .user
            .clone()
            .unwrap_or_else(User::unauthenticated)
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let (listener, user) = {
            let mut state = self.state.lock().unwrap();
            let listener = Arc::new(listener);
            state.listener = Some(Arc::clone(&listener));
            let user = state.user.clone().unwrap_or_else(User::unauthenticated);
            (listener, user)
        };
        listener(user);
    }

    fn remove_change_listener(&self) {
        self.state.lock().unwrap().listener = None;
    }
}
