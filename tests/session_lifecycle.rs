//! End-to-end drives of the session state machine: wake word to idle,
//! follow-up loops, timeouts, and preemption.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use skald::bus::Message;
use skald::config::SessionConfig;
use skald::contract::topics;
use skald::session::IntentResolver;
use skald::{Directive, Effect, IntentMatch, SessionEvent, SessionManager, SessionState, TimerKind};

/// Resolver stub with a fixed answer.
struct Resolver {
    intent: Option<IntentMatch>,
    generation: Option<u64>,
    fallbacks: Vec<String>,
}

impl Resolver {
    fn none() -> Self {
        Self {
            intent: None,
            generation: None,
            fallbacks: Vec::new(),
        }
    }

    fn matching(skill_id: &str, intent_name: &str) -> Self {
        Self {
            intent: Some(IntentMatch {
                skill_id: skill_id.to_owned(),
                intent_name: intent_name.to_owned(),
                generation: 1,
                score: 1.0,
                slots: HashMap::new(),
            }),
            generation: Some(1),
            fallbacks: Vec::new(),
        }
    }
}

impl IntentResolver for Resolver {
    fn resolve(&self, _utterance: &str) -> Option<IntentMatch> {
        self.intent.clone()
    }

    fn current_generation(&self, _skill_id: &str) -> Option<u64> {
        self.generation
    }

    fn fallback_chain(&self) -> Vec<String> {
        self.fallbacks.clone()
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

fn timers(directives: &[Directive]) -> Vec<TimerKind> {
    directives
        .iter()
        .filter_map(|d| match d {
            Directive::StartTimer { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

/// Wake word through intent dispatch to an Active session.
fn activated(manager: &mut SessionManager, resolver: &Resolver) -> String {
    manager.handle_event(SessionEvent::ListenTriggered, resolver);
    let out = manager.handle_event(
        SessionEvent::UtteranceReceived {
            text: "set an alarm".to_owned(),
            session_id: None,
        },
        resolver,
    );
    assert_eq!(manager.state(), SessionState::Active);
    assert_eq!(timers(&out), vec![TimerKind::SkillResponse]);
    manager.current().expect("active session").session_id.clone()
}

#[test]
fn happy_path_from_wake_word_to_idle() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("alarm.mark2", "set-alarm");
    let session_id = activated(&mut manager, &resolver);

    // Skill ends the session: two spoken lines around a GUI page.
    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: session_id.clone(),
            skill_id: "alarm.mark2".to_owned(),
            effects: vec![
                Effect::speak_dialog("alarm-set", "Alarm set"),
                Effect::ShowPage {
                    page_id: "alarm.mark2.confirmation".to_owned(),
                    data: Default::default(),
                },
                Effect::speak_dialog("alarm-next", "It rings in eight hours"),
            ],
        },
        &resolver,
    );
    assert_eq!(manager.state(), SessionState::Ending);
    // Only the first line goes out; the second is hinted for pre-synthesis.
    let msgs = published(&out);
    let speaks: Vec<_> = msgs.iter().filter(|m| m.msg_type == topics::SPEAK).collect();
    assert_eq!(speaks.len(), 1);
    assert_eq!(speaks[0].data_str("text"), Some("Alarm set"));
    assert!(msgs
        .iter()
        .any(|m| m.msg_type == topics::SPEAK_CACHE
            && m.data_str("text") == Some("It rings in eight hours")));
    assert!(!msgs.iter().any(|m| m.msg_type == topics::GUI_SHOW_PAGE));

    // First line finishes: the page shows and the second line starts.
    let out = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    let msgs = published(&out);
    assert!(msgs.iter().any(|m| m.msg_type == topics::GUI_SHOW_PAGE));
    assert!(msgs.iter().any(|m| m.msg_type == topics::SPEAK
        && m.data_str("text") == Some("It rings in eight hours")));

    // Second line finishes: drain complete, idle timer armed.
    let out = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    let msgs = published(&out);
    assert!(msgs
        .iter()
        .any(|m| m.msg_type == topics::SESSION_EFFECTS_COMPLETED));
    assert_eq!(timers(&out), vec![TimerKind::Idle]);

    // Idle timer fires: idle screen, clean session.ended, back to Idle.
    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Idle,
            session_id: session_id.clone(),
        },
        &resolver,
    );
    let msgs = published(&out);
    assert!(msgs.iter().any(|m| m.msg_type == topics::GUI_IDLE));
    let ended = msgs
        .iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("session.ended");
    assert_eq!(ended.data_bool("aborted"), Some(false));
    assert!(ended.data.get("attributed_to").is_none());
    assert_eq!(manager.state(), SessionState::Idle);
}

#[test]
fn follow_up_loops_back_to_the_owning_skill() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("timer.mark2", "start-timer");
    let session_id = activated(&mut manager, &resolver);

    // Skill continues and wants an answer.
    let out = manager.handle_event(
        SessionEvent::SkillContinued {
            session_id: session_id.clone(),
            skill_id: "timer.mark2".to_owned(),
            effects: vec![Effect::speak_dialog("ask-duration", "For how long?")],
            expects_response: true,
        },
        &resolver,
    );
    assert_eq!(published(&out).len(), 1); // just the question

    // Question finishes playing: listen re-opens, follow-up timer armed.
    let out = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    assert_eq!(manager.state(), SessionState::AwaitingFollowUp);
    let msgs = published(&out);
    let listen = msgs
        .iter()
        .find(|m| m.msg_type == topics::LISTEN)
        .expect("mic.listen");
    assert_eq!(listen.data_str("response_skill_id"), Some("timer.mark2"));
    assert!(msgs.iter().any(|m| m.msg_type == topics::SESSION_CONTINUED));
    assert_eq!(timers(&out), vec![TimerKind::FollowUp]);

    // The follow-up bypasses matching entirely.
    let out = manager.handle_event(
        SessionEvent::UtteranceReceived {
            text: "ten minutes".to_owned(),
            session_id: Some(session_id.clone()),
        },
        &Resolver::none(),
    );
    assert_eq!(manager.state(), SessionState::Active);
    let msgs = published(&out);
    let raw = msgs
        .iter()
        .find(|m| m.msg_type == "raw_utterance.timer.mark2")
        .expect("raw utterance to owner");
    assert_eq!(raw.data_str("utterance"), Some("ten minutes"));
    assert_eq!(timers(&out), vec![TimerKind::SkillResponse]);
}

#[test]
fn skill_response_timeout_force_ends_with_apology() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("slow.mark2", "anything");
    let session_id = activated(&mut manager, &resolver);

    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::SkillResponse,
            session_id: session_id.clone(),
        },
        &resolver,
    );
    assert_eq!(manager.state(), SessionState::Ending);
    let msgs = published(&out);
    let speak = msgs
        .iter()
        .find(|m| m.msg_type == topics::SPEAK)
        .expect("apology spoken");
    assert_eq!(speak.data_str("dialog_id"), Some("something-went-wrong"));

    // Drain the apology and the idle timer; the abort is attributed.
    manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Idle,
            session_id: session_id.clone(),
        },
        &resolver,
    );
    let msgs = published(&out);
    let ended = msgs
        .iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("session.ended");
    assert_eq!(ended.data_bool("aborted"), Some(true));
    assert_eq!(
        ended.data.get("attributed_to"),
        Some(&serde_json::json!(["slow.mark2"]))
    );
    assert_eq!(manager.state(), SessionState::Idle);
}

#[test]
fn new_wake_word_preempts_a_draining_session() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("news.mark2", "read-news");
    let old_id = activated(&mut manager, &resolver);

    // Skill ends with a long spoken line; it is in flight when the user
    // triggers a new session.
    manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: old_id.clone(),
            skill_id: "news.mark2".to_owned(),
            effects: vec![Effect::speak_dialog("headlines", "Today in the news...")],
        },
        &resolver,
    );

    let out = manager.handle_event(SessionEvent::ListenTriggered, &resolver);
    assert_eq!(manager.state(), SessionState::Listening);
    let new_id = manager.current().expect("new session").session_id.clone();
    assert_ne!(new_id, old_id);

    let msgs = published(&out);
    let ended = msgs
        .iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("old session ended");
    assert_eq!(ended.context.session_id.as_deref(), Some(old_id.as_str()));
    assert_eq!(ended.data_bool("aborted"), Some(true));

    // The in-flight line finishes after preemption: its completion no
    // longer matches any session and must not disturb the new one.
    let out = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: old_id.clone(),
        },
        &resolver,
    );
    assert!(out.is_empty());
    assert_eq!(manager.state(), SessionState::Listening);
    assert_eq!(manager.current().expect("new session").session_id, new_id);
}

#[test]
fn duplicate_speech_finished_is_idempotent() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("alarm.mark2", "set-alarm");
    let session_id = activated(&mut manager, &resolver);

    manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: session_id.clone(),
            skill_id: "alarm.mark2".to_owned(),
            effects: vec![Effect::speak_dialog("ok", "Done")],
        },
        &resolver,
    );
    let first = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    assert!(published(&first)
        .iter()
        .any(|m| m.msg_type == topics::SESSION_EFFECTS_COMPLETED));

    let second = manager.handle_event(
        SessionEvent::SpeechFinished {
            session_id: session_id.clone(),
        },
        &resolver,
    );
    assert!(second.is_empty());
}

#[test]
fn session_with_no_effects_still_completes_and_idles() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("mute.mark2", "toggle");
    let session_id = activated(&mut manager, &resolver);

    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: session_id.clone(),
            skill_id: "mute.mark2".to_owned(),
            effects: Vec::new(),
        },
        &resolver,
    );
    // Nothing to drain: completion is immediate, idle timer armed directly.
    let msgs = published(&out);
    assert!(msgs
        .iter()
        .any(|m| m.msg_type == topics::SESSION_EFFECTS_COMPLETED));
    assert_eq!(timers(&out), vec![TimerKind::Idle]);
}

#[test]
fn stale_response_timer_after_clean_end_is_ignored() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("alarm.mark2", "set-alarm");
    let session_id = activated(&mut manager, &resolver);

    // Skill ends cleanly; the response timer's expiry races its cancellation
    // and arrives while the session is already Ending.
    manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: session_id.clone(),
            skill_id: "alarm.mark2".to_owned(),
            effects: Vec::new(),
        },
        &resolver,
    );
    assert_eq!(manager.state(), SessionState::Ending);

    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::SkillResponse,
            session_id: session_id.clone(),
        },
        &resolver,
    );
    // No apology, no abort, no attribution: the clean ending is untouched.
    assert!(out.is_empty());
    let session = manager.current().expect("session still ending");
    assert_eq!(session.state, SessionState::Ending);
    assert!(!session.aborted);

    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::Idle,
            session_id,
        },
        &resolver,
    );
    let ended = published(&out)
        .into_iter()
        .find(|m| m.msg_type == topics::SESSION_ENDED)
        .expect("session.ended");
    assert_eq!(ended.data_bool("aborted"), Some(false));
    assert!(ended.data.get("attributed_to").is_none());
}

#[test]
fn stale_follow_up_timer_while_active_is_ignored() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("timer.mark2", "start-timer");
    let session_id = activated(&mut manager, &resolver);

    // A follow-up timer from an earlier turn expires after the session went
    // back to Active; it is only meaningful in AwaitingFollowUp.
    let out = manager.handle_event(
        SessionEvent::TimerFired {
            kind: TimerKind::FollowUp,
            session_id,
        },
        &resolver,
    );
    assert!(out.is_empty());
    assert_eq!(manager.state(), SessionState::Active);
    assert!(!manager.current().expect("session").aborted);
}

#[test]
fn late_skill_response_for_a_gone_session_is_ignored() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("alarm.mark2", "set-alarm");
    let _session_id = activated(&mut manager, &resolver);

    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id: "a-session-that-never-was".to_owned(),
            skill_id: "alarm.mark2".to_owned(),
            effects: vec![Effect::speak_dialog("late", "Too late")],
        },
        &resolver,
    );
    assert!(out.is_empty());
    assert_eq!(manager.state(), SessionState::Active);
}

#[test]
fn non_owner_cannot_end_the_session() {
    let mut manager = SessionManager::new(SessionConfig::default());
    let resolver = Resolver::matching("alarm.mark2", "set-alarm");
    let session_id = activated(&mut manager, &resolver);

    let out = manager.handle_event(
        SessionEvent::SkillEnded {
            session_id,
            skill_id: "impostor.mark2".to_owned(),
            effects: Vec::new(),
        },
        &resolver,
    );
    assert!(out.is_empty());
    assert_eq!(manager.state(), SessionState::Active);
}
