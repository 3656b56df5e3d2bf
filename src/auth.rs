use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::ActorId;

/// Shared-password auth. The login user names the acting account and must
/// be a numeric actor id.
#[derive(Debug)]
pub struct FacilityAuthSource {
    password: String,
}

impl FacilityAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// Actor id carried by a login user name.
pub fn parse_actor(user: Option<&str>) -> Option<ActorId> {
    user?.trim().parse().ok()
}

#[async_trait]
impl AuthSource for FacilityAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if parse_actor(login.user()).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user = ?login.user(), "login rejected: user is not an actor id");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".to_owned(),
                "28000".to_owned(),
                "user name must be a numeric actor id".to_owned(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_ids_parse_from_user_names() {
        assert_eq!(parse_actor(Some("42")), Some(42));
        assert_eq!(parse_actor(Some(" 7 ")), Some(7));
        assert_eq!(parse_actor(Some("-3")), Some(-3));
        assert_eq!(parse_actor(Some("alice")), None);
        assert_eq!(parse_actor(None), None);
    }
}
