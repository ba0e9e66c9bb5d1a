use crate::error::AppError;
use axum::{
    Json, async_trait,
    extract::FromRequest,
    http::Request,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// JSON extractor that runs the request type's validators and maps both
/// decode and validation failures onto the 400 error envelope.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S, axum::body::Body> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(
        req: Request<axum::body::Body>,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|_| AppError::validation("Invalid JSON body"))?;

        value.validate().map_err(|errors| {
            let detail = errors
                .field_errors()
                .iter()
                .flat_map(|(field, field_errors)| {
                    field_errors.iter().map(move |error| {
                        error
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("invalid {}", field))
                    })
                })
                .collect::<Vec<_>>()
                .join("; ");
            AppError::validation(detail)
        })?;

        Ok(ValidatedJson(value))
    }
}

pub mod rules {
    use validator::ValidationError;

    pub fn validate_username_format(username: &str) -> Result<(), ValidationError> {
        if username.len() < 3 {
            return Err(ValidationError::new("username_too_short"));
        }
        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ValidationError::new("invalid_username_format"));
        }
        if username.chars().next().is_some_and(|c| c.is_numeric()) {
            return Err(ValidationError::new("username_starts_with_number"));
        }
        Ok(())
    }

    pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
        if password.len() < 8 {
            return Err(ValidationError::new("password_too_short"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::rules::*;

    #[test]
    fn test_username_format() {
        assert!(validate_username_format("alice").is_ok());
        assert!(validate_username_format("al_ice-2").is_ok());
        assert!(validate_username_format("al").is_err());
        assert!(validate_username_format("2alice").is_err());
        assert!(validate_username_format("al ice").is_err());
    }

    #[test]
    fn test_password_strength() {
        assert!(validate_password_strength("longenough").is_ok());
        assert!(validate_password_strength("short").is_err());
    }
}
