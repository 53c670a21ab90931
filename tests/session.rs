mod common;

use common::{scripted, session, token};
use std::sync::Arc;
use std::time::{Duration, Instant};
use triton_llm_core::{
    transport::{InstanceGroup, InstanceKind, ModelConfig, Readiness, RepositoryModel},
    Error, GenerationParameters, ScriptedPush, ScriptedTransport, StreamEvent,
};

fn repository_model(name: &str) -> RepositoryModel {
    RepositoryModel {
        name: name.to_string(),
        version: "1".to_string(),
        state: "READY".to_string(),
        reason: String::new(),
    }
}

#[tokio::test]
async fn test_ensure_ready_is_idempotent() {
    let transport = Arc::new(ScriptedTransport::new(Readiness::AfterChecks(1)));
    let client = session(transport.clone());

    client.ensure_model_ready("ensemble", Duration::from_secs(1)).await.unwrap();
    assert_eq!(transport.load_calls(), 1);

    client.ensure_model_ready("ensemble", Duration::from_secs(1)).await.unwrap();
    assert_eq!(transport.load_calls(), 1);
}

#[tokio::test]
async fn test_ensure_ready_times_out() {
    let transport = Arc::new(ScriptedTransport::new(Readiness::Never));
    let client = session(transport.clone());
    let timeout = Duration::from_millis(200);

    let start = Instant::now();
    let err = client.ensure_model_ready("ensemble", timeout).await.unwrap_err();
    let waited = start.elapsed();

    match err {
        Error::ModelLoadTimeout { model, elapsed, .. } => {
            assert_eq!(model, "ensemble");
            assert!(elapsed >= timeout);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(waited >= timeout);
    assert!(waited < timeout + Duration::from_secs(2), "waited {:?}", waited);
    assert_eq!(transport.load_calls(), 1);
    assert!(transport.ready_calls() > 2);
}

#[tokio::test]
async fn test_list_models_keeps_server_order() {
    let transport = Arc::new(
        ScriptedTransport::ready()
            .with_model(repository_model("preprocessing"))
            .with_model(repository_model("tensorrt_llm"))
            .with_model(repository_model("ensemble")),
    );
    let client = session(transport);

    assert_eq!(
        client.list_models().await.unwrap(),
        vec!["preprocessing", "tensorrt_llm", "ensemble"]
    );
}

#[tokio::test]
async fn test_model_concurrency() {
    let transport = Arc::new(ScriptedTransport::ready().with_config(ModelConfig {
        name: "ensemble".to_string(),
        instance_groups: vec![
            InstanceGroup {
                name: "a".to_string(),
                kind: InstanceKind::Gpu,
                count: 2,
                gpus: vec![0, 1],
            },
            InstanceGroup {
                name: "b".to_string(),
                kind: InstanceKind::Gpu,
                count: 1,
                gpus: vec![0],
            },
        ],
        ..Default::default()
    }));
    let client = session(transport);

    assert_eq!(
        client
            .get_model_concurrency("ensemble", Duration::from_secs(1))
            .await
            .unwrap(),
        5
    );
}

#[tokio::test]
async fn test_concurrency_of_unknown_model_fails() {
    let client = session(Arc::new(ScriptedTransport::ready()));
    let err = client
        .get_model_concurrency("missing", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_events_arrive_in_push_order() {
    let transport = scripted(vec![
        token("a"),
        token("b"),
        ScriptedPush::FinalToken("c".to_string()),
    ]);
    let client = session(transport);

    let mut events = client
        .open_streaming_request("ensemble", "p", &GenerationParameters::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.next_event().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    client.close_streaming().await.unwrap();

    assert_eq!(
        seen,
        vec![
            StreamEvent::Token("a".to_string()),
            StreamEvent::Token("b".to_string()),
            StreamEvent::Token("c".to_string()),
            StreamEvent::End,
        ]
    );
}

#[tokio::test]
async fn test_streaming_does_not_load_model() {
    let transport = Arc::new(ScriptedTransport::new(Readiness::AfterChecks(1)));
    let client = session(transport.clone());

    let err = client
        .open_streaming_request("ensemble", "p", &GenerationParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelNotReady(_)));
    assert_eq!(transport.load_calls(), 0);
}
