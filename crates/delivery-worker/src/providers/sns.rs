//! 短信提供商适配器（AWS SNS）
//!
//! 调用 SNS Publish 接口直发短信（查询协议，表单编码）。
//! 收件人须为 E.164 格式号码，限流与 5xx 视为瞬时错误。

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

const SNS_API_VERSION: &str = "2010-03-31";

/// SNS 返回的可重试错误码
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottledException",
    "ServiceUnavailable",
    "InternalFailure",
    "InternalError",
];

/// 项目级 SNS 配置
#[derive(Debug, Deserialize)]
struct SnsConfig {
    #[serde(default)]
    sender_id: Option<String>,
    /// Transactional 或 Promotional
    #[serde(default)]
    sms_type: Option<String>,
}

/// 短信载荷
#[derive(Debug, Deserialize)]
struct SmsPayload {
    #[serde(default)]
    text: Option<String>,
}

/// SNS 短信发送适配器
pub struct SnsAdapter {
    encryptor: FieldEncryptor,
    policy: DispatchRetryPolicy,
    http: reqwest::Client,
}

impl SnsAdapter {
    pub fn new(encryptor: FieldEncryptor, policy: DispatchRetryPolicy) -> Self {
        Self {
            encryptor,
            policy,
            http: reqwest::Client::new(),
        }
    }

    /// 单次 Publish 调用
    async fn attempt(
        &self,
        creds: &AwsCredential,
        host: &str,
        url: &str,
        body: &str,
    ) -> Result<SendOutcome, ProviderError> {
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let headers = vec![
            (
                "content-type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ),
            ("host".to_string(), host.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];

        let authorization = sigv4::authorization_header(
            &SigningKey {
                access_key_id: &creds.access_key_id,
                secret_access_key: &creds.secret_access_key,
                region: &creds.region,
                service: "sns",
            },
            "POST",
            "/",
            "",
            &headers,
            body.as_bytes(),
            &amz_date,
        );

        let response = self
            .http
            .post(url)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("x-amz-date", &amz_date)
            .header("authorization", authorization)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("SNS 请求发送失败: {e}")))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("SNS 响应读取失败: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_sns_failure(status, &text));
        }

        let message_id = extract_xml_tag(&text, "MessageId").ok_or_else(|| {
            ProviderError::Vendor(format!("SNS 响应缺少 MessageId: {text}"))
        })?;

        debug!(provider_message_id = %message_id, "SNS 已接收短信");

        Ok(SendOutcome {
            details: json!({
                "provider": "sns",
                "messageId": message_id,
                "httpStatus": status,
            }),
            provider_message_id: message_id,
        })
    }
}

#[async_trait]
impl ProviderAdapter for SnsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        credential: &ProviderCredential,
        payload: &Value,
        config: &Value,
        recipient: &str,
    ) -> Result<SendOutcome, ProviderError> {
        let creds = decrypt_aws_credential(&self.encryptor, credential)?;
        let sns_config = parse_sns_config(config)?;
        let text = validate_sms_payload(payload)?;
        validate_phone_number(recipient)?;

        let body = build_publish_body(&text, &sns_config, recipient);
        let host = format!("sns.{}.amazonaws.com", creds.region);
        let url = format!("https://{host}/");

        call_with_retry(&self.policy, "sns.publish", || {
            self.attempt(&creds, &host, &url, &body)
        })
        .await
    }
}

/// 校验并解析 SNS 配置形状
fn parse_sns_config(config: &Value) -> Result<SnsConfig, ProviderError> {
    serde_json::from_value(config.clone())
        .map_err(|e| ProviderError::Structural(format!("SNS 配置形状不符: {e}")))
}

/// 校验短信载荷：text 必填且非空
fn validate_sms_payload(payload: &Value) -> Result<String, ProviderError> {
    let parsed: SmsPayload = serde_json::from_value(payload.clone())
        .map_err(|e| ProviderError::Structural(format!("短信载荷形状不符: {e}")))?;

    match parsed.text {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(ProviderError::Structural(
            "短信载荷缺少 text".to_string(),
        )),
    }
}

/// 校验收件人为 E.164 格式（+ 前缀、其后全为数字、总长不超过 15 位）
fn validate_phone_number(recipient: &str) -> Result<(), ProviderError> {
    let digits = recipient.strip_prefix('+').unwrap_or("");
    let valid = !digits.is_empty()
        && digits.len() <= 15
        && digits.bytes().all(|b| b.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ProviderError::Structural(format!(
            "收件人不是有效 E.164 号码: {}",
            courier_shared::crypto::mask_phone(recipient)
        )))
    }
}

/// 组装 Publish 请求体（表单编码）
fn build_publish_body(text: &str, config: &SnsConfig, recipient: &str) -> String {
    let mut pairs: Vec<(String, String)> = vec![
        ("Action".to_string(), "Publish".to_string()),
        ("Message".to_string(), text.to_string()),
        ("PhoneNumber".to_string(), recipient.to_string()),
        ("Version".to_string(), SNS_API_VERSION.to_string()),
    ];

    let mut attr_index = 1;
    if let Some(sender_id) = &config.sender_id {
        push_message_attribute(&mut pairs, attr_index, "AWS.SNS.SMS.SenderID", sender_id);
        attr_index += 1;
    }
    if let Some(sms_type) = &config.sms_type {
        push_message_attribute(&mut pairs, attr_index, "AWS.SNS.SMS.SMSType", sms_type);
    }

    let borrowed: Vec<(&str, &str)> = pairs
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    sigv4::form_urlencode(&borrowed)
}

fn push_message_attribute(
    pairs: &mut Vec<(String, String)>,
    index: u32,
    name: &str,
    value: &str,
) {
    pairs.push((
        format!("MessageAttributes.entry.{index}.Name"),
        name.to_string(),
    ));
    pairs.push((
        format!("MessageAttributes.entry.{index}.Value.DataType"),
        "String".to_string(),
    ));
    pairs.push((
        format!("MessageAttributes.entry.{index}.Value.StringValue"),
        value.to_string(),
    ));
}

/// 按 HTTP 状态与错误码分类 SNS 失败响应
fn classify_sns_failure(status: u16, body: &str) -> ProviderError {
    let code = extract_xml_tag(body, "Code").unwrap_or_default();
    let detail = extract_xml_tag(body, "Message").unwrap_or_else(|| body.to_string());

    let message = format!("SNS 返回 {status} {code}: {detail}");

    if status >= 500 || TRANSIENT_ERROR_CODES.contains(&code.as_str()) {
        ProviderError::Transient(message)
    } else {
        ProviderError::Vendor(message)
    }
}

/// 提取 XML 响应中首个指定标签的文本内容
///
/// SNS 错误/成功响应结构简单且无嵌套同名标签，字符串查找足够。
fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}
