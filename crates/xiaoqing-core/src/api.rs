//! Account endpoints: SMS codes, registration, login and passwords.
//!
//! Every call that yields a token stores it in the injected [`Session`].

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, detail_from_body};
use crate::session::Session;
use crate::state::TokenResponse;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What an SMS code will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsPurpose {
    Registration,
    PasswordReset,
}

/// Reply to `POST /sms/send`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmsReceipt {
    pub message: String,
    /// Codes the number may still request this period.
    pub remaining: i64,
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    phone: &'a str,
    #[serde(rename = "type")]
    purpose: SmsPurpose,
}

#[derive(Serialize)]
struct VerifyCodeRequest<'a> {
    phone: &'a str,
    code: &'a str,
    #[serde(rename = "type")]
    purpose: SmsPurpose,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    phone: &'a str,
    password: &'a str,
    code: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    phone: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ResetPasswordRequest<'a> {
    phone: &'a str,
    code: &'a str,
    new_password: &'a str,
}

#[derive(Serialize)]
struct PasswordChangeRequest<'a> {
    phone: &'a str,
    old_password: &'a str,
    new_password: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    SendSms,
    VerifyCode,
    Register,
    Login,
    ResetPassword,
    ChangePassword,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::SendSms => "sending the code",
            Operation::VerifyCode => "code verification",
            Operation::Register => "registration",
            Operation::Login => "login",
            Operation::ResetPassword => "password reset",
            Operation::ChangePassword => "password change",
        }
    }

    /// Friendly text for error details the backend is known to send.
    fn hint(self, body: &str) -> Option<&'static str> {
        let code_problem = body.contains("验证码错误") || body.contains("验证码已过期");
        let no_code = body.contains("未找到有效的验证码记录");
        match self {
            Operation::Register if code_problem => Some(CODE_INVALID),
            Operation::Register if body.contains("该手机号已注册") => Some(PHONE_TAKEN),
            Operation::Register if no_code => Some(CODE_MISSING),
            Operation::ResetPassword if code_problem => Some(CODE_INVALID),
            Operation::ResetPassword
                if body.contains("该手机号未注册") || body.contains("用户不存在") =>
            {
                Some(PHONE_UNKNOWN)
            }
            Operation::ResetPassword if no_code => Some(CODE_MISSING),
            _ => None,
        }
    }
}

const CODE_INVALID: &str = "The verification code is wrong or has expired, please request a new one";
const CODE_MISSING: &str = "No valid verification code found, please request a new one";
const PHONE_TAKEN: &str = "This phone number is already registered";
const PHONE_UNKNOWN: &str = "This phone number is not registered";

#[derive(Clone)]
pub struct AccountClient {
    client: Client,
    base_url: String,
    session: Session,
}

impl AccountClient {
    pub fn new(base_url: impl Into<String>, session: Session) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into(),
            session,
        }
    }

    pub fn from_config(config: &Config, session: Session) -> Self {
        Self::new(config.base_url.clone(), session)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn send_sms(&self, phone: &str, purpose: SmsPurpose) -> Result<SmsReceipt, ApiError> {
        info!(phone, ?purpose, "requesting sms code");
        let response = self
            .client
            .post(self.url("sms/send"))
            .json(&SmsRequest { phone, purpose })
            .send()
            .await?;
        let response = check(Operation::SendSms, response).await?;
        decode(response).await
    }

    pub async fn verify_code(&self, phone: &str, code: &str, purpose: SmsPurpose) -> Result<(), ApiError> {
        info!(phone, ?purpose, "verifying sms code");
        let response = self
            .client
            .post(self.url("sms"))
            .json(&VerifyCodeRequest { phone, code, purpose })
            .send()
            .await?;
        check(Operation::VerifyCode, response).await?;
        Ok(())
    }

    pub async fn register(&self, phone: &str, password: &str, code: &str) -> Result<TokenResponse, ApiError> {
        info!(phone, "registering account");
        let response = self
            .client
            .post(self.url("users"))
            .json(&RegisterRequest { phone, password, code })
            .send()
            .await?;
        self.store_token(Operation::Register, phone, response).await
    }

    pub async fn login(&self, phone: &str, password: &str) -> Result<TokenResponse, ApiError> {
        info!(phone, "logging in");
        let response = self
            .client
            .post(self.url("login"))
            .json(&LoginRequest { phone, password })
            .send()
            .await?;
        self.store_token(Operation::Login, phone, response).await
    }

    pub async fn reset_password(
        &self,
        phone: &str,
        code: &str,
        new_password: &str,
    ) -> Result<TokenResponse, ApiError> {
        info!(phone, "resetting password");
        let response = self
            .client
            .post(self.url("users/reset-password"))
            .json(&ResetPasswordRequest {
                phone,
                code,
                new_password,
            })
            .send()
            .await?;
        self.store_token(Operation::ResetPassword, phone, response).await
    }

    /// Changes the password of the logged in account.
    ///
    /// Needs a token; a 401 means it expired and clears the session.
    pub async fn change_password(
        &self,
        phone: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<TokenResponse, ApiError> {
        let Some(auth_header) = self.session.auth_header() else {
            warn!("password change rejected locally: no login token");
            return Err(ApiError::NotLoggedIn);
        };

        info!(phone, "changing password");
        let response = self
            .client
            .put(self.url("users/password"))
            .header(reqwest::header::AUTHORIZATION, auth_header)
            .json(&PasswordChangeRequest {
                phone,
                old_password,
                new_password,
            })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("password change: token rejected; clearing session");
            self.session.clear();
            return Err(ApiError::SessionExpired);
        }
        self.store_token(Operation::ChangePassword, phone, response).await
    }

    async fn store_token(
        &self,
        operation: Operation,
        phone: &str,
        response: Response,
    ) -> Result<TokenResponse, ApiError> {
        let response = check(operation, response).await?;
        let token: TokenResponse = decode(response).await?;
        self.session.save_login(phone, &token);
        debug!(operation = operation.label(), "token stored");
        Ok(token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

async fn check(operation: Operation, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    debug!(operation = operation.label(), status = status.as_u16(), "account response");
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = operation
        .hint(&body)
        .map(str::to_string)
        .or_else(|| detail_from_body(&body))
        .unwrap_or_else(|| format!("{} failed: {}", operation.label(), status.as_u16()));
    warn!(operation = operation.label(), status = status.as_u16(), body = %body, "account request rejected");
    Err(ApiError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
}
