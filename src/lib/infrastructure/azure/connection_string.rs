//! ACS connection strings and HMAC request signing

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use super::http_date;
use crate::domain::dispatch::errors::ProviderError;

type HmacSha256 = Hmac<Sha256>;

/// The headers that authenticate a request signed with an access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// `x-ms-date`, in RFC 1123 format
    pub date: String,

    /// `x-ms-content-sha256`
    pub content_hash: String,

    /// `Authorization`
    pub authorization: String,
}

/// A parsed `endpoint=...;accesskey=...` connection string
#[derive(Clone)]
pub struct AcsConnectionString {
    endpoint: Url,
    access_key: Vec<u8>,
}

impl AcsConnectionString {
    /// The resource endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Signs a request with the access key.
    ///
    /// The string to sign is `METHOD\npath?query\ndate;host;content-hash`.
    pub fn sign(&self, method: &str, url: &Url, body: &[u8], at: DateTime<Utc>) -> SignedHeaders {
        let date = http_date(at);
        let content_hash = STANDARD.encode(Sha256::digest(body));

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };

        let string_to_sign = format!(
            "{}\n{}\n{};{};{}",
            method.to_uppercase(),
            path_and_query,
            date,
            host,
            content_hash
        );

        let mut mac = HmacSha256::new_from_slice(&self.access_key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        SignedHeaders {
            authorization: format!(
                "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={signature}"
            ),
            date,
            content_hash,
        }
    }
}

impl FromStr for AcsConnectionString {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut access_key = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };

            if key.eq_ignore_ascii_case("endpoint") {
                endpoint = Some(value.trim());
            } else if key.eq_ignore_ascii_case("accesskey") {
                access_key = Some(value.trim());
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            ProviderError::Configuration("connection string has no endpoint".to_string())
        })?;
        let access_key = access_key.ok_or_else(|| {
            ProviderError::Configuration("connection string has no accesskey".to_string())
        })?;

        Ok(Self {
            endpoint: Url::parse(endpoint).map_err(|err| {
                ProviderError::Configuration(format!("invalid connection string endpoint: {err}"))
            })?,
            access_key: STANDARD.decode(access_key).map_err(|err| {
                ProviderError::Configuration(format!("invalid connection string access key: {err}"))
            })?,
        })
    }
}

impl fmt::Debug for AcsConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcsConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use testresult::TestResult;

    use super::*;

    const CONNECTION_STRING: &str =
        "endpoint=https://acs.example.com/;accesskey=dGVzdC1hY2Nlc3Mta2V5";

    #[test]
    fn test_parse_connection_string() -> TestResult {
        let parsed: AcsConnectionString = CONNECTION_STRING.parse()?;

        assert_eq!(parsed.endpoint().as_str(), "https://acs.example.com/");
        assert_eq!(parsed.access_key, b"test-access-key");

        Ok(())
    }

    #[test]
    fn test_parse_ignores_key_case_and_order() -> TestResult {
        let parsed: AcsConnectionString =
            "AccessKey=dGVzdC1hY2Nlc3Mta2V5; Endpoint=https://acs.example.com/;".parse()?;

        assert_eq!(parsed.endpoint().host_str(), Some("acs.example.com"));

        Ok(())
    }

    #[test]
    fn test_parse_rejects_incomplete_connection_strings() {
        assert!(matches!(
            "endpoint=https://acs.example.com/".parse::<AcsConnectionString>(),
            Err(ProviderError::Configuration(_))
        ));
        assert!(matches!(
            "accesskey=dGVzdC1hY2Nlc3Mta2V5".parse::<AcsConnectionString>(),
            Err(ProviderError::Configuration(_))
        ));
        assert!(matches!(
            "endpoint=https://acs.example.com/;accesskey=!!!".parse::<AcsConnectionString>(),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[test]
    fn test_debug_redacts_access_key() -> TestResult {
        let parsed: AcsConnectionString = CONNECTION_STRING.parse()?;

        assert!(!format!("{parsed:?}").contains("dGVzdC1hY2Nlc3Mta2V5"));

        Ok(())
    }

    #[test]
    fn test_sign_request() -> TestResult {
        let parsed: AcsConnectionString = CONNECTION_STRING.parse()?;
        let url = Url::parse("https://acs.example.com/emails:send?api-version=2023-03-31")?;
        let at = Utc.with_ymd_and_hms(2024, 10, 15, 10, 0, 0).unwrap();

        let headers = parsed.sign("post", &url, br#"{"hello":"world"}"#, at);

        assert_eq!(headers.date, "Tue, 15 Oct 2024 10:00:00 GMT");
        assert_eq!(
            headers.content_hash,
            "k6I5cakU5erL8KjSUVTNownDwccvu5kU1Hxg88toFYg="
        );
        assert_eq!(
            headers.authorization,
            "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature=ILGpeW3HQjlmke2/xnyZpMruYEdjFqVG44VTDVOfHes="
        );

        Ok(())
    }

    #[test]
    fn test_sign_empty_body() -> TestResult {
        let parsed: AcsConnectionString = CONNECTION_STRING.parse()?;
        let url = Url::parse("https://acs.example.com/emails/operations/abc?api-version=2023-03-31")?;

        let headers = parsed.sign("GET", &url, b"", Utc::now());

        assert_eq!(
            headers.content_hash,
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );

        Ok(())
    }
}
