//! 邮件提供商适配器（AWS SES）
//!
//! 调用 SES v2 SendEmail 接口。事务型邮件要求 subject 必填，
//! html/text 至少其一。限流与 5xx 视为瞬时错误进入退避重试。

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use courier_shared::crypto::FieldEncryptor;
use courier_shared::models::{Channel, ProviderCredential};
use courier_shared::retry::DispatchRetryPolicy;

use super::sigv4::{self, SigningKey};
use super::{AwsCredential, ProviderAdapter, ProviderError, SendOutcome, call_with_retry, decrypt_aws_credential};

/// SES v2 SendEmail 的请求路径
const SEND_EMAIL_PATH: &str = "/v2/email/outbound-emails";

/// SES 返回的可重试错误类型
///
/// 对应 x-amzn-ErrorType 头的异常名；此外 HTTP 429 与 >= 500 一律视为瞬时。
const TRANSIENT_ERROR_TYPES: &[&str] = &[
    "TooManyRequestsException",
    "SendingPausedException",
    "ServiceUnavailableException",
    "InternalServiceErrorException",
];

/// 项目级 SES 配置（发件人身份等）
#[derive(Debug, Deserialize)]
struct SesConfig {
    from_address: String,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    configuration_set: Option<String>,
}

/// 邮件载荷
#[derive(Debug, Deserialize)]
struct EmailPayload {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// SES 邮件发送适配器
pub struct SesAdapter {
    encryptor: FieldEncryptor,
    policy: DispatchRetryPolicy,
    http: reqwest::Client,
}

impl SesAdapter {
    pub fn new(encryptor: FieldEncryptor, policy: DispatchRetryPolicy) -> Self {
        Self {
            encryptor,
            policy,
            http: reqwest::Client::new(),
        }
    }

    /// 单次 SendEmail 调用
    async fn attempt(
        &self,
        creds: &AwsCredential,
        host: &str,
        url: &str,
        body: &[u8],
    ) -> Result<SendOutcome, ProviderError> {
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];

        let authorization = sigv4::authorization_header(
            &SigningKey {
                access_key_id: &creds.access_key_id,
                secret_access_key: &creds.secret_access_key,
                region: &creds.region,
                service: "ses",
            },
            "POST",
            SEND_EMAIL_PATH,
            "",
            &headers,
            body,
            &amz_date,
        );

        // 网络层失败（连接拒绝、超时）按瞬时错误处理
        let response = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .header("x-amz-date", &amz_date)
            .header("authorization", authorization)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("SES 请求发送失败: {e}")))?;

        let status = response.status().as_u16();
        let error_type = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("SES 响应读取失败: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_ses_failure(status, error_type.as_deref(), &text));
        }

        let message_id = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("MessageId").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| {
                ProviderError::Vendor(format!("SES 响应缺少 MessageId: {text}"))
            })?;

        debug!(provider_message_id = %message_id, "SES 已接收邮件");

        Ok(SendOutcome {
            details: json!({
                "provider": "ses",
                "messageId": message_id,
                "httpStatus": status,
            }),
            provider_message_id: message_id,
        })
    }
}

#[async_trait]
impl ProviderAdapter for SesAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        credential: &ProviderCredential,
        payload: &Value,
        config: &Value,
        recipient: &str,
    ) -> Result<SendOutcome, ProviderError> {
        let creds = decrypt_aws_credential(&self.encryptor, credential)?;
        let ses_config = parse_ses_config(config)?;
        let email = validate_email_payload(payload)?;

        if !recipient.contains('@') {
            return Err(ProviderError::Structural(format!(
                "收件人不是有效邮箱地址: {}",
                courier_shared::crypto::mask_email(recipient)
            )));
        }

        let body = build_send_email_body(&email, &ses_config, recipient);
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::Structural(format!("请求体序列化失败: {e}")))?;

        let host = format!("email.{}.amazonaws.com", creds.region);
        let url = format!("https://{host}{SEND_EMAIL_PATH}");

        call_with_retry(&self.policy, "ses.send_email", || {
            self.attempt(&creds, &host, &url, &body_bytes)
        })
        .await
    }
}

/// 校验并解析 SES 配置形状
fn parse_ses_config(config: &Value) -> Result<SesConfig, ProviderError> {
    let parsed: SesConfig = serde_json::from_value(config.clone())
        .map_err(|e| ProviderError::Structural(format!("SES 配置形状不符: {e}")))?;

    if !parsed.from_address.contains('@') {
        return Err(ProviderError::Structural(format!(
            "SES 配置的 from_address 不是有效邮箱: {}",
            courier_shared::crypto::mask_email(&parsed.from_address)
        )));
    }

    Ok(parsed)
}

/// 校验邮件载荷的必填字段
///
/// 事务型邮件 subject 必填；正文 html/text 至少其一非空。
fn validate_email_payload(payload: &Value) -> Result<EmailPayload, ProviderError> {
    let parsed: EmailPayload = serde_json::from_value(payload.clone())
        .map_err(|e| ProviderError::Structural(format!("邮件载荷形状不符: {e}")))?;

    match &parsed.subject {
        Some(subject) if !subject.trim().is_empty() => {}
        _ => {
            return Err(ProviderError::Structural(
                "邮件载荷缺少 subject".to_string(),
            ));
        }
    }

    let has_html = parsed.html.as_deref().is_some_and(|s| !s.is_empty());
    let has_text = parsed.text.as_deref().is_some_and(|s| !s.is_empty());
    if !has_html && !has_text {
        return Err(ProviderError::Structural(
            "邮件载荷缺少正文（html/text 至少其一）".to_string(),
        ));
    }

    Ok(parsed)
}

/// 组装 SES v2 SendEmail 请求体
fn build_send_email_body(email: &EmailPayload, config: &SesConfig, recipient: &str) -> Value {
    let mut body_section = json!({});
    if let Some(html) = email.html.as_deref().filter(|s| !s.is_empty()) {
        body_section["Html"] = json!({"Data": html});
    }
    if let Some(text) = email.text.as_deref().filter(|s| !s.is_empty()) {
        body_section["Text"] = json!({"Data": text});
    }

    let mut request = json!({
        "FromEmailAddress": config.from_address,
        "Destination": {"ToAddresses": [recipient]},
        "Content": {
            "Simple": {
                "Subject": {"Data": email.subject.as_deref().unwrap_or_default()},
                "Body": body_section,
            }
        },
    });

    if let Some(reply_to) = &config.reply_to {
        request["ReplyToAddresses"] = json!([reply_to]);
    }
    if let Some(set) = &config.configuration_set {
        request["ConfigurationSetName"] = json!(set);
    }

    request
}

/// 按 HTTP 状态与异常类型分类 SES 失败响应
fn classify_ses_failure(status: u16, error_type: Option<&str>, body: &str) -> ProviderError {
    // x-amzn-ErrorType 的值可能形如 "TooManyRequestsException:http://..."
    let error_name = error_type
        .map(|t| t.split(':').next().unwrap_or(t))
        .unwrap_or("");

    let message = format!("SES 返回 {status} {error_name}: {body}");

    if status >= 500 || status == 429 || TRANSIENT_ERROR_TYPES.contains(&error_name) {
        ProviderError::Transient(message)
    } else {
        ProviderError::Vendor(message)
    }
}
