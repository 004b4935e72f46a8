//! Request-scoped login context
//!
//! The caller identity travels in a tokio task-local, set by the inbound
//! adapter for the duration of one request and read by outbound adapters
//! that forward it downstream. Work spawned onto other tasks must carry it
//! explicitly with [`LoginContext::scope`].

use std::future::Future;

/// Header carrying the caller's user id
pub const LOGIN_USER_ID_HEADER: &str = "Login-User-ID";
/// Header carrying the caller's token
pub const LOGIN_TOKEN_HEADER: &str = "Login-Token";

/// Identity of the caller of the current request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginUser {
    pub user_id: Option<String>,
    pub token: Option<String>,
}

impl LoginUser {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: Some(token.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none() && self.token.is_none()
    }

    /// Header name/value pairs to forward downstream
    pub fn headers(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (LOGIN_USER_ID_HEADER, self.user_id.as_deref()),
            (LOGIN_TOKEN_HEADER, self.token.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

tokio::task_local! {
    static LOGIN_USER: LoginUser;
}

/// Access to the task-local login slot
pub struct LoginContext;

impl LoginContext {
    /// Run `fut` with `user` as the current login
    pub async fn scope<F: Future>(user: LoginUser, fut: F) -> F::Output {
        LOGIN_USER.scope(user, fut).await
    }

    /// The current login, if inside a scope
    pub fn current() -> Option<LoginUser> {
        LOGIN_USER.try_with(LoginUser::clone).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_sets_and_clears() {
        assert_eq!(LoginContext::current(), None);

        let seen = LoginContext::scope(LoginUser::new("42", "t"), async {
            tokio::task::yield_now().await;
            LoginContext::current()
        })
        .await;
        assert_eq!(seen.unwrap().user_id.as_deref(), Some("42"));

        assert_eq!(LoginContext::current(), None);
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit() {
        let inner = LoginContext::scope(LoginUser::new("42", "t"), async {
            tokio::spawn(async { LoginContext::current() }).await.unwrap()
        })
        .await;
        assert_eq!(inner, None);
    }

    #[test]
    fn test_headers_skip_missing_values() {
        let user = LoginUser {
            user_id: Some("7".into()),
            token: None,
        };
        let headers: Vec<_> = user.headers().collect();
        assert_eq!(headers, [(LOGIN_USER_ID_HEADER, "7")]);
        assert!(LoginUser::default().is_anonymous());
    }
}
