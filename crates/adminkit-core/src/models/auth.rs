use serde::{Deserialize, Serialize};

/// A server-issued captcha challenge.
///
/// The challenge is opaque to this crate: the id is echoed back at login
/// next to the user's answer, and the image is handed to an external
/// widget to render. Each challenge is consumable at most once; after a
/// rejected login the caller must fetch a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CaptchaChallenge {
    /// One-time challenge id, sent back as `captchaId`.
    #[serde(rename = "uuid")]
    pub id: String,
    /// Base64-encoded PNG for the widget to display.
    #[serde(rename = "imageData")]
    pub image_data: String,
}

/// Credentials submitted to the login endpoint. The captcha pair is
/// optional; backends that do not issue challenges leave it absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha: Option<String>,
    #[serde(rename = "captchaId", skip_serializing_if = "Option::is_none")]
    pub captcha_id: Option<String>,
}

/// Payload for account creation. The captcha pair is mandatory here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
    pub nickname: String,
    pub phone: String,
    pub email: String,
    pub captcha: String,
    #[serde(rename = "captchaId")]
    pub captcha_id: String,
}

/// Profile of the signed-in user, returned by a successful login.
/// The credential pair itself is managed by the session layer and never
/// appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthUser {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_omits_absent_captcha() {
        let without = LoginRequest {
            username: "admin".to_string(),
            password: "hunter22".to_string(),
            captcha: None,
            captcha_id: None,
        };
        let json = serde_json::to_value(&without).expect("serialize login request");
        assert!(json.get("captcha").is_none());
        assert!(json.get("captchaId").is_none());

        let with = LoginRequest {
            captcha: Some("abcd".to_string()),
            captcha_id: Some("5f3a".to_string()),
            ..without
        };
        let json = serde_json::to_value(&with).expect("serialize login request");
        assert_eq!(json["captcha"], "abcd");
        assert_eq!(json["captchaId"], "5f3a");
    }

    #[test]
    fn captcha_challenge_parses_wire_names() {
        let json = r#"{"uuid": "d9c1a2b3", "imageData": "iVBORw0KGgo="}"#;
        let challenge: CaptchaChallenge =
            serde_json::from_str(json).expect("parse captcha response");
        assert_eq!(challenge.id, "d9c1a2b3");
        assert_eq!(challenge.image_data, "iVBORw0KGgo=");
    }
}
