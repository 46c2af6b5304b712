use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use warden_control::http_api;
use warden_control::listener::AgentListener;
use warden_control::registry::Registry;
use warden_control::state::AppState;
use warden_proto::commands::RegisterPayload;
use warden_proto::{FramedLink, Kind, Message};

struct Harness {
    agent_addr: SocketAddr,
    http_base: String,
    client: reqwest::Client,
}

async fn start_harness() -> Harness {
    let registry = Registry::new();

    let agent_listener = AgentListener::bind("127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(agent_listener.serve());

    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    let app = http_api::router(AppState { registry });
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap();
    });

    Harness {
        agent_addr,
        http_base: format!("http://{http_addr}"),
        client: reqwest::Client::new(),
    }
}

async fn connect_agent(harness: &Harness, agent_id: &str, servers: &[&str]) -> Arc<FramedLink> {
    let stream = TcpStream::connect(harness.agent_addr).await.unwrap();
    let link = Arc::new(FramedLink::new(stream));
    let payload = RegisterPayload {
        servers: servers.iter().map(|s| s.to_string()).collect(),
    };
    link.send(&Message::register(agent_id, &payload).unwrap())
        .await
        .unwrap();
    link
}

/// Echo agent: answers every request with a canned payload.
fn spawn_responder(link: Arc<FramedLink>, agent_id: &'static str) {
    tokio::spawn(async move {
        while let Ok(msg) = link.recv().await {
            if msg.kind != Kind::Request {
                continue;
            }
            let resp = match msg.request_type.as_str() {
                "status" => Message::response(
                    agent_id,
                    &msg.id,
                    &serde_json::json!({ "name": msg.payload.unwrap()["server"], "running": false }),
                )
                .unwrap(),
                other => Message::error_response(
                    agent_id,
                    &msg.id,
                    format!("unknown command type: {other}"),
                ),
            };
            if link.send(&resp).await.is_err() {
                break;
            }
        }
    });
}

async fn wait_for_agent(harness: &Harness, agent_id: &str, present: bool) {
    for _ in 0..100 {
        let status = harness
            .client
            .get(format!("{}/agents/{agent_id}", harness.http_base))
            .send()
            .await
            .unwrap()
            .status();
        if (status == reqwest::StatusCode::OK) == present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent {agent_id} did not become present={present}");
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let harness = start_harness().await;
    let resp = harness
        .client
        .get(format!("{}/healthz", harness.http_base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn registered_agent_shows_up_in_the_http_api() {
    let harness = start_harness().await;
    let _link = connect_agent(&harness, "agent-1", &["web", "db"]).await;
    wait_for_agent(&harness, "agent-1", true).await;

    let body: serde_json::Value = harness
        .client
        .get(format!("{}/agents", harness.http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "agent-1");

    let info: serde_json::Value = harness
        .client
        .get(format!("{}/agents/agent-1", harness.http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["servers"], serde_json::json!(["web", "db"]));

    let missing = harness
        .client
        .get(format!("{}/agents/ghost", harness.http_base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_round_trips_through_the_relay() {
    let harness = start_harness().await;
    let link = connect_agent(&harness, "agent-1", &["web"]).await;
    wait_for_agent(&harness, "agent-1", true).await;
    spawn_responder(link, "agent-1");

    let resp = harness
        .client
        .get(format!(
            "{}/agents/agent-1/servers/web/status",
            harness.http_base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "web");
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn agent_errors_surface_as_bad_request_with_context() {
    let harness = start_harness().await;
    let link = connect_agent(&harness, "agent-1", &["web"]).await;
    wait_for_agent(&harness, "agent-1", true).await;
    spawn_responder(link, "agent-1");

    // The responder only implements `status`; start comes back as an
    // agent-side error.
    let resp = harness
        .client
        .post(format!(
            "{}/agents/agent-1/servers/web/start",
            harness.http_base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["agent_id"], "agent-1");
    assert_eq!(body["server"], "web");
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("unknown command type"));
}

#[tokio::test]
async fn commands_to_unconnected_agents_fail_cleanly() {
    let harness = start_harness().await;
    let resp = harness
        .client
        .get(format!(
            "{}/agents/nobody/servers/web/status",
            harness.http_base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not connected"));
}

#[tokio::test]
async fn reconnect_restores_operator_visibility() {
    let harness = start_harness().await;

    let link = connect_agent(&harness, "agent-1", &["web"]).await;
    wait_for_agent(&harness, "agent-1", true).await;

    // Abrupt disconnect: the receive loop removes the agent.
    drop(link);
    wait_for_agent(&harness, "agent-1", false).await;

    let _link = connect_agent(&harness, "agent-1", &["web", "cache"]).await;
    wait_for_agent(&harness, "agent-1", true).await;

    let info: serde_json::Value = harness
        .client
        .get(format!("{}/agents/agent-1", harness.http_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["servers"], serde_json::json!(["web", "cache"]));
}

#[tokio::test]
async fn reregister_updates_the_advertised_servers() {
    let harness = start_harness().await;
    let link = connect_agent(&harness, "agent-1", &["web"]).await;
    wait_for_agent(&harness, "agent-1", true).await;

    let payload = RegisterPayload {
        servers: vec!["web".to_string(), "worker".to_string()],
    };
    link.send(&Message::register("agent-1", &payload).unwrap())
        .await
        .unwrap();

    for _ in 0..100 {
        let info: serde_json::Value = harness
            .client
            .get(format!("{}/agents/agent-1", harness.http_base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if info["servers"] == serde_json::json!(["web", "worker"]) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registration update never became visible");
}

#[tokio::test]
async fn malformed_instance_bodies_are_rejected() {
    let harness = start_harness().await;
    let _link = connect_agent(&harness, "agent-1", &[]).await;
    wait_for_agent(&harness, "agent-1", true).await;

    let resp = harness
        .client
        .post(format!(
            "{}/agents/agent-1/instances/create",
            harness.http_base
        ))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid json body");
}
