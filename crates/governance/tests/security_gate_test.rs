//! Integration tests for the security gate, sessions and audit trail.

use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use neural_bridge_core::config::{RateLimitConfig, RateLimitRule, SecurityConfig};
use neural_bridge_core::{ErrorKind, SecurityError};
use neural_bridge_governance::{
    AuditFilter, AuditOutcome, AuditStore, InMemoryAuditStore, SecurityGate, SessionManager,
};

fn config(default_max: u32, commands: &[(&str, u32)]) -> SecurityConfig {
    SecurityConfig {
        rate_limit: RateLimitConfig {
            default: RateLimitRule {
                max_requests: default_max,
                window_secs: 60,
            },
            commands: commands
                .iter()
                .map(|(name, max)| {
                    (
                        name.to_string(),
                        RateLimitRule {
                            max_requests: *max,
                            window_secs: 60,
                        },
                    )
                })
                .collect::<HashMap<_, _>>(),
        },
        ..SecurityConfig::default()
    }
}

fn gate(config: &SecurityConfig) -> (SecurityGate, Arc<InMemoryAuditStore>) {
    let sessions = Arc::new(SessionManager::new(config));
    let audit = Arc::new(InMemoryAuditStore::new());
    let gate = SecurityGate::new(config, sessions)
        .unwrap()
        .with_audit_store(audit.clone());
    (gate, audit)
}

#[tokio::test]
async fn test_third_request_in_window_is_rate_limited() {
    let config = config(2, &[]);
    let (gate, audit) = gate(&config);
    let issued = gate.sessions().create_session(["execute"]).await;
    let token = issued.token.expose_secret();
    let payload = r#"{"task_description":"fizzbuzz","mode":"single","tool_hint":"CodeGen"}"#;

    assert!(gate.authorize(token, "execute", payload).await.is_ok());
    assert!(gate.authorize(token, "execute", payload).await.is_ok());
    let err = gate.authorize(token, "execute", payload).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    match err {
        SecurityError::RateLimited {
            command_class,
            retry_after_ms,
        } => {
            assert_eq!(command_class, "default");
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
        }
        other => panic!("unexpected rejection {:?}", other),
    }

    let accepted = audit
        .query(AuditFilter {
            outcome: Some(AuditOutcome::Accepted),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(accepted.len(), 2);
    assert_eq!(audit.len(), 3);
}

#[tokio::test]
async fn test_command_classes_have_separate_budgets() {
    let config = config(1, &[("execute", 2)]);
    let (gate, _) = gate(&config);
    let issued = gate
        .sessions()
        .create_session(["execute", "list_sandboxes", "health_check"])
        .await;
    let token = issued.token.expose_secret();

    assert!(gate.authorize(token, "execute", "{}").await.is_ok());
    assert!(gate.authorize(token, "execute", "{}").await.is_ok());
    assert!(gate.authorize(token, "execute", "{}").await.is_err());

    // Commands without their own rule share the default class.
    assert!(gate.authorize(token, "list_sandboxes", "{}").await.is_ok());
    let err = gate.authorize(token, "health_check", "{}").await.unwrap_err();
    assert!(matches!(err, SecurityError::RateLimited { ref command_class, .. } if command_class == "default"));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let config = config(1, &[]);
    let (gate, _) = gate(&config);
    let a = gate.sessions().create_session(["execute"]).await;
    let b = gate.sessions().create_session(["execute"]).await;

    assert!(gate.authorize(a.token.expose_secret(), "execute", "{}").await.is_ok());
    assert!(gate.authorize(a.token.expose_secret(), "execute", "{}").await.is_err());
    assert!(gate.authorize(b.token.expose_secret(), "execute", "{}").await.is_ok());
}

#[tokio::test]
async fn test_revoked_session_rejected() {
    let config = config(100, &[]);
    let (gate, _) = gate(&config);
    let issued = gate.sessions().create_session(["execute"]).await;
    let token = issued.token.expose_secret();

    gate.sessions().revoke_session(token).await.unwrap();
    let err = gate.authorize(token, "execute", "{}").await.unwrap_err();
    assert_eq!(err, SecurityError::UnknownSession);
    assert_eq!(err.kind(), ErrorKind::SecurityRejected);
}

#[tokio::test(start_paused = true)]
async fn test_pruner_removes_idle_sessions() {
    let config = SecurityConfig {
        idle_timeout_secs: 60,
        ..config(100, &[])
    };
    let sessions = Arc::new(SessionManager::new(&config));
    sessions.create_session(["execute"]).await;
    let pruner = sessions.spawn_pruner(Duration::from_secs(30));

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(sessions.session_count(), 0);
    pruner.abort();
}
