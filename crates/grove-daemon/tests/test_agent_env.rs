//! Agent environment plumbing: the data root's `env` file is the base, the
//! request's `agentEnv` overrides it, and the merged result reaches the
//! agent process — on START and again on RESTART.

mod common;

use std::time::Duration;

use common::Harness;
use grove_proto::{Request, RequestType};
use grove_types::{paths, InstanceState};

/// An agent that prints its credential environment once, then idles.
const ENV_ECHO_OVERLAY: &str = concat!(
    "agent:\n",
    "  command: /bin/sh\n",
    "  args: [\"-c\", \"echo cred=[$CLAUDE_CODE_OAUTH_TOKEN][$ANTHROPIC_API_KEY]; exec cat\"]\n",
);

async fn wait_for_log(h: &Harness, id: &str, needle: &str) -> String {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let log = h.instance_log(id);
        if log.contains(needle) {
            return log;
        }
        if std::time::Instant::now() > deadline {
            panic!("log never contained {needle:?}: {log:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn request_env_reaches_the_agent_process() {
    let h = Harness::start().await;
    h.add_project("app", ENV_ECHO_OVERLAY);

    let mut req = Request::new(RequestType::Start);
    req.project = "app".into();
    req.branch = "b".into();
    req.agent_env
        .insert("CLAUDE_CODE_OAUTH_TOKEN".into(), "sk-start-e2e".into());
    let resp = h.rpc(&req).await;
    assert!(resp.ok, "start failed: {}", resp.error);

    wait_for_log(&h, &resp.instance_id, "cred=[sk-start-e2e]").await;
    h.shutdown();
}

#[tokio::test]
async fn env_file_is_the_base_and_request_overrides_it() {
    let h = Harness::start().await;
    std::fs::write(
        paths::env_file(h.root.path()),
        "CLAUDE_CODE_OAUTH_TOKEN=sk-from-file\nANTHROPIC_API_KEY=sk-file-api\n",
    )
    .unwrap();
    h.add_project("app", ENV_ECHO_OVERLAY);

    // No request env: the agent sees the env file entries.
    let id = h.start_instance("app", "base").await;
    wait_for_log(&h, &id, "cred=[sk-from-file][sk-file-api]").await;

    // A request entry overrides the file entry for that key only.
    let mut req = Request::new(RequestType::Start);
    req.project = "app".into();
    req.branch = "override".into();
    req.agent_env
        .insert("CLAUDE_CODE_OAUTH_TOKEN".into(), "sk-from-request".into());
    let resp = h.rpc(&req).await;
    assert!(resp.ok, "start failed: {}", resp.error);
    wait_for_log(&h, &resp.instance_id, "cred=[sk-from-request][sk-file-api]").await;
    h.shutdown();
}

#[tokio::test]
async fn restart_env_is_re_derived_from_the_request() {
    let h = Harness::start().await;
    h.add_project("app", ENV_ECHO_OVERLAY);

    let mut req = Request::new(RequestType::Start);
    req.project = "app".into();
    req.branch = "b".into();
    req.agent_env
        .insert("ANTHROPIC_API_KEY".into(), "sk-first-run".into());
    let resp = h.rpc(&req).await;
    assert!(resp.ok, "start failed: {}", resp.error);
    let id = resp.instance_id;
    wait_for_log(&h, &id, "[sk-first-run]").await;

    h.rpc(&Request::for_instance(RequestType::Stop, &id)).await;
    assert!(
        h.wait_for_state(&id, InstanceState::Killed, Duration::from_secs(5))
            .await
    );

    // The restart request carries a fresh environment; the respawned agent
    // sees the new value, not the old one.
    let mut req = Request::for_instance(RequestType::Restart, &id);
    req.agent_env
        .insert("ANTHROPIC_API_KEY".into(), "sk-after-restart".into());
    let resp = h.rpc(&req).await;
    assert!(resp.ok, "restart failed: {}", resp.error);
    wait_for_log(&h, &id, "[sk-after-restart]").await;
    h.shutdown();
}
