use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};
use urlencoding::encode;

use crate::mcmc::{Batch, McmcSink};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_ID_LEN: usize = 5;
const CONFIG_URL_ENV: &str = "CONFIG_URL";
const CONFIG_HOST: &str = "https://coinfer.ai/config";

/// Returned when the server rejects the token.
#[derive(Debug, thiserror::Error)]
#[error("Unauthorized")]
pub struct Unauthorized;

/// Identity of the current run, attached to messages and status updates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunInfo {
    pub experiment_id: String,
    pub batch_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    run_info: RunInfo,
}

impl ApiClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            run_info: RunInfo::default(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn run_info(&self) -> &RunInfo {
        &self.run_info
    }

    pub fn set_run_info(&mut self, run_info: RunInfo) {
        self.run_info = run_info;
    }

    fn url(&self, name: &str, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if name.is_empty() {
            format!("{}/{path}", self.endpoint)
        } else {
            format!("{}/{name}/{path}", self.endpoint)
        }
    }

    async fn get(&self, url: &str) -> Result<Value> {
        let request_id = request_id();
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("bearer {}", self.token))
            .header("x-request-id", &request_id)
            .send()
            .await
            .with_context(|| format!("[{request_id}] GET {url} failed"))?;
        response_data(response)
            .await
            .with_context(|| format!("[{request_id}] GET {url}"))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        let request_id = request_id();
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("bearer {}", self.token))
            .header("x-request-id", &request_id)
            .json(body)
            .send()
            .await
            .with_context(|| format!("[{request_id}] POST {url} failed"))?;
        response_data(response)
            .await
            .with_context(|| format!("[{request_id}] POST {url}"))
    }

    /// Broadcast a message to the experiment's subscribers.
    pub async fn sendmsg(&self, group: &str, message: Value) -> Result<Value> {
        let url = self.url(
            "api",
            &format!("/object/{}", encode(&self.run_info.experiment_id)),
        );
        let mut payload = json!({
            "object_type": "experiment.text_message",
            "datas": [{
                "group": group,
                "type": "object_broadcast",
                "message": message,
            }],
        });
        merge_object(&mut payload, serde_json::to_value(&self.run_info)?);
        self.post(&url, &json!({ "payload": payload })).await
    }

    /// Update experiment fields; the run info and status are mirrored into
    /// `meta.run_info`.
    pub async fn update_experiment(&self, experiment_id: &str, mut data: Map<String, Value>) -> Result<Value> {
        let mut run_info = serde_json::to_value(&self.run_info)?;
        if let Some(status) = data.get("status").cloned() {
            merge_object(&mut run_info, json!({ "status": status }));
        }
        let meta = data
            .entry("meta")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| anyhow!("experiment meta must be an object"))?;
        let existing = meta.entry("run_info").or_insert_with(|| json!({}));
        merge_object(existing, run_info);

        let mut payload = json!({ "object_type": "experiment" });
        merge_object(&mut payload, Value::Object(data));
        let url = self.url("api", &format!("/object/{}", encode(experiment_id)));
        self.post(&url, &json!({ "payload": payload })).await
    }

    pub async fn create_experiment(
        &self,
        model_id: &str,
        workflow_id: &str,
        input_id: &str,
        meta: Value,
        name: &str,
        run_on: &str,
    ) -> Result<Value> {
        let url = self.url("api", "/object");
        let body = json!({
            "payload": {
                "object_type": "experiment",
                "model_id": model_id,
                "workflow_id": workflow_id,
                "input_id": input_id,
                "meta": meta,
                "name": name,
                "run_on": run_on,
            }
        });
        self.post(&url, &body).await
    }

    pub async fn get_object(&self, object_id: &str) -> Result<Value> {
        let url = self.url("api", &format!("/object/{}", encode(object_id)));
        self.get(&url).await
    }

    pub async fn get_user_info(&self) -> Result<Value> {
        let url = self.url("base", "/user");
        self.get(&url).await
    }

    /// Return the workflow's experiment, creating it when the workflow has
    /// none yet. Yields `(experiment, workflow)`.
    pub async fn ensure_experiment_for_workflow(
        &self,
        workflow_id: &str,
        experiment_name: &str,
        engine: &str,
    ) -> Result<(Value, Value)> {
        let mut workflow = self.get_object(workflow_id).await?;
        if let Some(experiment_id) = non_empty_str(workflow.get("experiment_id")) {
            let experiment = self.get_object(&experiment_id).await?;
            return Ok((experiment, workflow));
        }

        let model_id = non_empty_str(workflow.get("model_id"))
            .ok_or_else(|| anyhow!("workflow {workflow_id} has no model_id"))?;
        let input_id = non_empty_str(workflow.get("data_id")).unwrap_or_default();
        let experiment = self
            .create_experiment(
                &model_id,
                workflow_id,
                &input_id,
                json!({ "status": "RUN" }),
                experiment_name,
                engine,
            )
            .await?;
        let short_id = experiment
            .get("short_id")
            .cloned()
            .ok_or_else(|| anyhow!("created experiment has no short_id"))?;
        merge_object(
            &mut workflow,
            json!({ "experiment_id": short_id, "experiment_name": experiment_name }),
        );
        Ok((experiment, workflow))
    }

    pub async fn send_mcmc_data(
        &self,
        experiment_id: &str,
        batch_id: &str,
        run_id: &str,
        logs: &Batch,
    ) -> Result<()> {
        let url = self.url("api", &format!("/object/{}", encode(experiment_id)));
        let body = json!({
            "payload": {
                "object_type": "experiment.protobuf_message",
                "logs": logs,
                "batch_id": batch_id,
                "run_id": run_id,
            }
        });
        self.post(&url, &body).await?;
        Ok(())
    }

    /// Ask the deployment's post-processing hook to pick up a finished run.
    /// Failures are logged and never returned.
    pub async fn call_after_sample_lambda(&self, experiment_id: &str, batch_id: &str, run_id: &str) {
        let config_url = match std::env::var(CONFIG_URL_ENV) {
            Ok(url) if !url.is_empty() => Ok(url),
            _ => config_url_for(&self.endpoint),
        };
        let result = match config_url {
            Ok(config_url) => {
                self.after_sample(&config_url, experiment_id, batch_id, run_id)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!("failed to call after_sample lambda: {err:#}");
        }
    }

    async fn after_sample(
        &self,
        config_url: &str,
        experiment_id: &str,
        batch_id: &str,
        run_id: &str,
    ) -> Result<()> {
        info!("get lambda url from: {config_url}");
        let config: Value = self
            .http
            .get(config_url)
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(|| format!("GET {config_url} failed"))?
            .json()
            .await
            .context("invalid deployment config")?;
        let lambda_url = config
            .pointer("/data/run_model_url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("deployment config has no data.run_model_url"))?;
        info!("lambda url: {lambda_url}");

        let body = json!({
            "cmd": "after_sample",
            "experiment_id": experiment_id,
            "wd_auth_token": self.token,
            "coinfer_server_endpoint": self.endpoint,
            "batch_id": batch_id,
            "run_id": run_id,
        });
        self.http
            .post(lambda_url)
            .json(&body)
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(|| format!("POST {lambda_url} failed"))?;
        Ok(())
    }
}

impl McmcSink for ApiClient {
    async fn send_mcmc_data(
        &self,
        experiment_id: &str,
        batch_id: &str,
        run_id: &str,
        payload: &Batch,
    ) -> Result<()> {
        ApiClient::send_mcmc_data(self, experiment_id, batch_id, run_id, payload).await
    }
}

async fn response_data(response: Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Unauthorized.into());
    }
    let text = response.text().await.context("failed to read response body")?;
    let envelope: Envelope = serde_json::from_str(&text).with_context(|| {
        format!(
            "invalid JSON response ({status}): {}",
            text.chars().take(100).collect::<String>()
        )
    })?;
    if envelope.status != "ok" {
        let message = envelope.message.unwrap_or_else(|| envelope.status.clone());
        error!(%status, "{message}");
        bail!(message);
    }
    debug!(%status, "request ok");
    Ok(match envelope.data {
        Some(Value::Null) | None => json!({}),
        Some(data) => data,
    })
}

/// Deployment config for `endpoint`: the host with dots turned into dashes.
fn config_url_for(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint).with_context(|| format!("invalid endpoint: {endpoint}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("invalid endpoint: {endpoint}"))?;
    Ok(format!("{CONFIG_HOST}/{}.json", host.replace('.', "-")))
}

fn merge_object(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        target.extend(extra);
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn request_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..REQUEST_ID_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::{body_of, serve};
    use super::*;
    use crate::mcmc::Scalar;

    fn ok(data: Value) -> (u16, String) {
        (200, json!({ "status": "ok", "data": data }).to_string())
    }

    #[tokio::test]
    async fn send_mcmc_data_posts_logs_payload() -> Result<()> {
        let (url, server) = serve(vec![ok(Value::Null)]).await?;
        let client = ApiClient::new(&format!("{url}/"), "tok")?;

        let mut batch = Batch::default();
        batch.push("c1", "mu", 1, Scalar::Float(0.5));
        batch.push("c1", "bad", 1, Scalar::Float(f64::NAN));
        client.send_mcmc_data("exp1", "b1", "r1", &batch).await?;

        let requests = server.await?;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("POST /api/object/exp1 "));
        assert!(requests[0].to_lowercase().contains("authorization: bearer tok"));
        assert!(requests[0].to_lowercase().contains("x-request-id: "));
        assert_eq!(
            body_of(&requests[0]),
            json!({
                "payload": {
                    "object_type": "experiment.protobuf_message",
                    "logs": {
                        "vars": {"c1": {"mu": [0.5], "bad": [null]}},
                        "iteration": {"c1": [1, 1]}
                    },
                    "batch_id": "b1",
                    "run_id": "r1"
                }
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn error_envelope_and_unauthorized_are_errors() -> Result<()> {
        let (url, server) = serve(vec![
            (200, json!({"status": "error", "message": "no such experiment"}).to_string()),
            (401, "{}".to_string()),
        ])
        .await?;
        let client = ApiClient::new(&url, "tok")?;

        let err = client.get_object("missing").await.unwrap_err();
        assert!(format!("{err:#}").contains("no such experiment"));

        let err = client.get_user_info().await.unwrap_err();
        assert!(err.downcast_ref::<Unauthorized>().is_some());
        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn update_experiment_mirrors_run_info_and_status() -> Result<()> {
        let (url, server) = serve(vec![ok(json!({}))]).await?;
        let mut client = ApiClient::new(&url, "tok")?;
        client.set_run_info(RunInfo {
            experiment_id: "exp1".to_string(),
            batch_id: "b1".to_string(),
            run_id: "r1".to_string(),
            ..RunInfo::default()
        });

        let mut data = Map::new();
        data.insert("status".to_string(), json!("RUN"));
        client.update_experiment("exp1", data).await?;

        let requests = server.await?;
        assert_eq!(
            body_of(&requests[0]),
            json!({
                "payload": {
                    "object_type": "experiment",
                    "status": "RUN",
                    "meta": {"run_info": {
                        "experiment_id": "exp1",
                        "batch_id": "b1",
                        "run_id": "r1",
                        "status": "RUN"
                    }}
                }
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn ensure_experiment_creates_when_missing() -> Result<()> {
        let (url, server) = serve(vec![
            ok(json!({"model_id": "m1", "data_id": null, "experiment_id": ""})),
            ok(json!({"short_id": "exp9"})),
        ])
        .await?;
        let client = ApiClient::new(&url, "tok")?;

        let (experiment, workflow) = client
            .ensure_experiment_for_workflow("wf1", "first run", "julia")
            .await?;
        assert_eq!(experiment["short_id"], "exp9");
        assert_eq!(workflow["experiment_id"], "exp9");

        let requests = server.await?;
        assert!(requests[0].starts_with("GET /api/object/wf1 "));
        let create = body_of(&requests[1]);
        assert_eq!(create["payload"]["model_id"], "m1");
        assert_eq!(create["payload"]["input_id"], "");
        assert_eq!(create["payload"]["run_on"], "julia");
        Ok(())
    }

    #[test]
    fn config_url_follows_endpoint_host() -> Result<()> {
        assert_eq!(
            config_url_for("https://api.dev.coinfer.ai:8443/")?,
            "https://coinfer.ai/config/api-dev-coinfer-ai.json"
        );
        assert!(config_url_for("not a url").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn after_sample_posts_run_to_lambda() -> Result<()> {
        let (lambda_url, lambda) = serve(vec![(200, "{}".to_string())]).await?;
        let (config_url, config) = serve(vec![(
            200,
            json!({"data": {"run_model_url": format!("{lambda_url}/run")}}).to_string(),
        )])
        .await?;
        let client = ApiClient::new("http://server.test", "tok")?;

        client
            .after_sample(&format!("{config_url}/config.json"), "exp1", "b1", "r1")
            .await?;

        let config_requests = config.await?;
        assert!(config_requests[0].starts_with("GET /config.json "));
        let lambda_requests = lambda.await?;
        assert!(lambda_requests[0].starts_with("POST /run "));
        assert_eq!(
            body_of(&lambda_requests[0]),
            json!({
                "cmd": "after_sample",
                "experiment_id": "exp1",
                "wd_auth_token": "tok",
                "coinfer_server_endpoint": "http://server.test",
                "batch_id": "b1",
                "run_id": "r1"
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn after_sample_without_lambda_url_is_an_error() -> Result<()> {
        let (config_url, config) = serve(vec![(200, json!({"data": {}}).to_string())]).await?;
        let client = ApiClient::new("http://server.test", "tok")?;

        let err = client
            .after_sample(&config_url, "exp1", "b1", "r1")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("run_model_url"));
        config.await?;
        Ok(())
    }
}
