use std::time::Duration;

use serde_json::{json, Value};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a verification round trip against the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    Invalid(String),
    Network(String),
}

/// Provider errors arrive as free text; sort credential trouble from
/// connectivity trouble the same way a user would read the message.
pub fn classify_error_text(message: &str) -> VerifyOutcome {
    let lower = message.to_lowercase();
    if lower.contains("authentication") || lower.contains("api key") || lower.contains("unauthorized")
    {
        VerifyOutcome::Invalid("API key is invalid or expired".to_string())
    } else if lower.contains("connection") || lower.contains("connect") {
        VerifyOutcome::Network("network connection failed".to_string())
    } else {
        VerifyOutcome::Invalid(format!("verification failed: {message}"))
    }
}

/// One minimal chat-completion call to prove the credential works.
pub async fn verify_credential(
    http: &reqwest::Client,
    base_url: &str,
    model: &str,
    api_key: &str,
) -> VerifyOutcome {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let key = if api_key.is_empty() {
        "sk-placeholder"
    } else {
        api_key
    };
    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": 5,
        "temperature": 0.0,
    });

    let response = http
        .post(&url)
        .bearer_auth(key)
        .json(&body)
        .timeout(VERIFY_TIMEOUT)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) if err.is_timeout() || err.is_connect() => {
            return VerifyOutcome::Network("network connection failed".to_string());
        }
        Err(err) => return classify_error_text(&err.to_string()),
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return VerifyOutcome::Invalid("API key is invalid or expired".to_string());
    }

    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return classify_error_text(&err.to_string()),
    };

    if !status.is_success() {
        let message = payload
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("provider returned an error");
        return classify_error_text(message);
    }

    let has_choices = payload
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| !choices.is_empty())
        .unwrap_or(false);
    if has_choices {
        VerifyOutcome::Valid
    } else {
        VerifyOutcome::Invalid("provider returned an unexpected response".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_errors_mean_invalid_key() {
        assert!(matches!(
            classify_error_text("401 Authentication failed"),
            VerifyOutcome::Invalid(_)
        ));
        assert!(matches!(
            classify_error_text("your API key was rejected"),
            VerifyOutcome::Invalid(_)
        ));
    }

    #[test]
    fn connection_errors_mean_network_trouble() {
        assert_eq!(
            classify_error_text("error sending request: Connection refused"),
            VerifyOutcome::Network("network connection failed".to_string())
        );
    }

    #[test]
    fn other_errors_surface_the_message() {
        match classify_error_text("model not found") {
            VerifyOutcome::Invalid(message) => assert!(message.contains("model not found")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
