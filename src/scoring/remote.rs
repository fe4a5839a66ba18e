use super::{Estimate, FireProbability};
use crate::error::ScoringError;
use crate::reading::Reading;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for an external analytics function that scores a stored reading.
#[derive(Clone, Debug)]
pub struct RemoteScorer {
    client: Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreRequest<'a> {
    node_id: &'a str,
    row_id: i64,
    temp: Option<f64>,
    flame: Option<u8>,
    #[serde(rename = "utc_datetime_string")]
    utc_datetime_string: String,
}

#[derive(Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    fire_probability: Option<f64>,
    #[serde(default)]
    r_value: Option<f64>,
}

impl RemoteScorer {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> Result<Self, ScoringError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, token })
    }

    pub async fn invoke(&self, row_id: i64, reading: &Reading) -> Result<Estimate, ScoringError> {
        let body = ScoreRequest {
            node_id: &reading.node_id,
            row_id,
            temp: reading.temperature,
            flame: reading.flame_present.map(u8::from),
            utc_datetime_string: reading.timestamp.to_rfc3339(),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ScoringError::Status(response.status().as_u16()));
        }
        let parsed: ScoreResponse = response.json().await?;
        interpret_response(parsed)
    }
}

fn interpret_response(parsed: ScoreResponse) -> Result<Estimate, ScoringError> {
    let probability = parsed.fire_probability.ok_or(ScoringError::Unscored)?;
    Ok(Estimate {
        probability: FireProbability::new(probability)?,
        r_value: parsed.r_value.filter(|value| value.is_finite()),
    })
}
