//! AWS Signature Version 4 请求签名
//!
//! SES/SNS 适配器共用的签名实现：规范化请求 -> 待签字符串 ->
//! 派生签名密钥 -> Authorization 头。只支持本系统用到的子集
//! （单值头、已规范化的查询字符串、完整载荷哈希）。

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// 签名所需的凭证与作用域
pub struct SigningKey<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

/// 计算 Authorization 头的值
///
/// - `canonical_query`：已按 SigV4 规则编码并排序的查询字符串（无查询时传 ""）
/// - `headers`：参与签名的头（至少包含 host 与 x-amz-date）；
///   名称会被转为小写、值去除首尾空白后按名称排序
/// - `amz_date`：ISO8601 基本格式时间戳，如 `20150830T123600Z`
pub fn authorization_header(
    key: &SigningKey<'_>,
    method: &str,
    path: &str,
    canonical_query: &str,
    headers: &[(String, String)],
    payload: &[u8],
    amz_date: &str,
) -> String {
    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    normalized.sort();

    let signed_headers = normalized
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = normalized
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let canonical_request = format!(
        "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex(payload)
    );

    let date_stamp = amz_date.get(..8).unwrap_or(amz_date);
    let scope = format!(
        "{date_stamp}/{}/{}/aws4_request",
        key.region, key.service
    );

    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    // 逐级派生签名密钥：date -> region -> service -> aws4_request
    let k_date = hmac(
        format!("AWS4{}", key.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac(&k_date, key.region.as_bytes());
    let k_service = hmac(&k_region, key.service.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");

    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        key.access_key_id
    )
}

/// SigV4 要求的 URI 百分号编码（RFC 3986 非保留字符除外）
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// 按 application/x-www-form-urlencoded 编码键值对
///
/// SNS 查询协议的请求体格式；键保持调用方给定的顺序。
pub fn form_urlencode(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 接受任意长度密钥，new_from_slice 不会失败
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC 密钥长度不受限");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
