//! Delegation: a skill hands session ownership to a child skill, which must
//! end the session itself or get force-ended on timeout.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use skald::bus::Message;
use skald::config::SessionConfig;
use skald::contract::topics;
use skald::session::IntentResolver;
use skald::{Directive, Effect, IntentMatch, SessionEvent, SessionManager, SessionState, TimerKind};

struct Resolver;

impl IntentResolver for Resolver {
    fn resolve(&self, _utterance: &str) -> Option<IntentMatch> {
        Some(IntentMatch {
            skill_id: "query.mark2".to_owned(),
            intent_name: "ask".to_owned(),
            generation: 1,
            score: 1.0,
            slots: HashMap::new(),
        })
    }

    fn current_generation(&self, _skill_id: &str) -> Option<u64> {
        Some(1)
    }

    fn fallback_chain(&self) -> Vec<String> {
        Vec::new()
    }
}

fn published(directives: &[Directive]) -> Vec<Message> {
    directives
        .iter()
        .filter_map(|d| match d {
            Directive::Publish(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

/// Drive a session to Active ownership by `query.mark2`, then delegate to
/// `wiki.mark2`. Returns (parent_session_id, child_session_id, directives).
fn delegated(manager: &mut SessionManager) -> (String, String, Vec<Directive>) {
    manager.handle_event(SessionEvent::ListenTriggered, &Resolver);
    manager.handle_event(
        SessionEvent::UtteranceReceived {
            text: "who was marie curie".to_owned(),
            session_id: None,
        },
        &Resolver,
    );
    let parent_id = manager.current().expect("parent").session_id.clone();

    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: parent_id.clone(),
            skill_id: "query.mark2".to_owned(),
            effects: vec![Effect::Delegate {
                child_skill_id: "wiki.mark2".to_owned(),
                data: serde_json::Map::from_iter([(
                    "query".to_owned(),
                    serde_json::Value::String("marie curie".to_owned()),
                )]),
            }],
        },
        &Resolver,
    );
    let child_id = manager.current().expect("child").session_id.clone();
    (parent_id, child_id, out)
}

#[test]
fn delegation_creates_a_child_session_owned_by_the_child_skill() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let (parent_id, child_id, out) = delegated(&mut manager);

    assert_ne!(parent_id, child_id);
    assert_eq!(manager.state(), SessionState::Active);
    let child = manager.current().expect("child session");
    assert_eq!(child.owner_skill_id.as_deref(), Some("wiki.mark2"));
    assert_eq!(child.delegate_of.as_deref(), Some(parent_id.as_str()));

    let msgs = published(&out);
    let announced = msgs
        .iter()
        .find(|m| m.msg_type == topics::SESSION_DELEGATED)
        .expect("session.delegated");
    assert_eq!(
        announced.data_str("parent_session_id"),
        Some(parent_id.as_str())
    );
    assert_eq!(
        announced.data_str("child_session_id"),
        Some(child_id.as_str())
    );

    let invoke = msgs
        .iter()
        .find(|m| m.msg_type == "delegate.invoke.wiki.mark2")
        .expect("delegate.invoke");
    assert_eq!(invoke.data_str("parent_skill_id"), Some("query.mark2"));
    assert_eq!(invoke.context.session_id.as_deref(), Some(child_id.as_str()));

    let armed: Vec<_> = out
        .iter()
        .filter_map(|d| match d {
            Directive::StartTimer { kind, session_id, .. } => Some((*kind, session_id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(armed, vec![(TimerKind::Delegation, child_id)]);
}

#[test]
fn child_can_end_the_delegated_session_normally() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let (_parent_id, child_id, _out) = delegated(&mut manager);

    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: child_id.clone(),
            skill_id: "wiki.mark2".to_owned(),
            effects: vec![Effect::speak_dialog("wiki-answer", "She discovered radium")],
        },
        &Resolver,
    );
    assert_eq!(manager.state(), SessionState::Ending);
    assert!(published(&out).iter().any(|m| m.msg_type == topics::SPEAK));

    manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: child_id.clone(),
        },
        &Resolver,
    );
    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Idle,
            session_id: child_id,
        },
        &Resolver,
    );
    let ended = published(&out)
        .into_iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("session.ended");
    assert_eq!(ended.data_bool("aborted"), Some(false));
    assert_eq!(manager.state(), SessionState::Idle);
}

#[test]
fn delegation_timeout_is_attributed_to_both_skills() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let (_parent_id, child_id, _out) = delegated(&mut manager);

    // Child never ends the session: the delegation timer force-ends it with
    // an apology and a GUI clear.
    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Delegation,
            session_id: child_id.clone(),
        },
        &Resolver,
    );
    assert_eq!(manager.state(), SessionState::Ending);
    let msgs = published(&out);
    assert!(msgs
        .iter()
        .any(|m| m.msg_type == topics::SPEAK
            && m.data_str("dialog_id") == Some("something-went-wrong")));

    // The GUI clear follows once the apology finishes.
    let out = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: child_id.clone(),
        },
        &Resolver,
    );
    assert!(published(&out)
        .iter()
        .any(|m| m.msg_type == topics::GUI_CLEAR));

    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Idle,
            session_id: child_id,
        },
        &Resolver,
    );
    let ended = published(&out)
        .into_iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("session.ended");
    assert_eq!(ended.data_bool("aborted"), Some(true));
    assert_eq!(
        ended.data.get("attributed_to"),
        Some(&serde_json::json!(["query.mark2", "wiki.mark2"]))
    );
    assert_eq!(manager.state(), SessionState::Idle);
}
