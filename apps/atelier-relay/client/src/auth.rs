/// Read access to whatever holds the signed-in session.
///
/// Token storage and refresh live outside the relay; transports call the
/// accessor each time they (re)connect so a refreshed token is picked up.
pub trait AuthProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
}

/// Fixed credentials, for tools and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    token: Option<String>,
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            user_id: Some(user_id.into()),
        }
    }
}

impl AuthProvider for StaticAuth {
    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl AuthProvider for Anonymous {
    fn access_token(&self) -> Option<String> {
        None
    }

    fn user_id(&self) -> Option<String> {
        None
    }
}
