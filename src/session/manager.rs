//! The session state machine.
//!
//! Owns "the current conversation": at most one session is in any non-Idle
//! state at a time, and every session deterministically returns to idle.
//! The manager is event-driven and run-to-completion — it never blocks on
//! I/O. Bus traffic and timer expiries come in as [`SessionEvent`]s; bus
//! publishes and timer arming go out as [`Directive`]s for the service loop
//! to execute. Continuations (waiting for `speech.finished`, a skill reply,
//! a fallback verdict) are plain state, keyed by session id, so late or
//! duplicated events are discarded by an explicit equality check rather
//! than by ordering assumptions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::message::Message;
use crate::config::SessionConfig;
use crate::contract::{self, topics, SessionEndedPayload};
use crate::intent::IntentMatch;
use crate::session::effect::Effect;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No conversation; idle screen.
    Idle,
    /// Wake word heard, waiting for the transcribed utterance.
    Listening,
    /// Utterance received, selecting a skill (may be consulting fallbacks).
    Matching,
    /// A skill owns the session and is working on a response.
    Active,
    /// The owning skill asked for a follow-up; the next utterance bypasses
    /// the matcher and goes straight to that skill.
    AwaitingFollowUp,
    /// Effects are draining; reverts to idle once speech completes and the
    /// GUI idle timeout elapses.
    Ending,
}

/// Timers the service loop arms on the manager's behalf.
///
/// A session has at most one timer armed at any moment, so cancellation is
/// per-session rather than per-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Owning skill must answer an intent invocation.
    SkillResponse,
    /// User must produce a follow-up utterance.
    FollowUp,
    /// Delegated child skill must end the session.
    Delegation,
    /// Consulted fallback skill must accept or decline.
    FallbackResponse,
    /// GUI idle reversion after the last effect completes.
    Idle,
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Wake word or explicit listen trigger.
    ListenTriggered,
    /// A transcribed utterance, optionally tagged with the session it
    /// belongs to.
    UtteranceReceived {
        text: String,
        session_id: Option<String>,
    },
    /// Owning skill declared `session.end` with effects.
    SkillEnded {
        session_id: String,
        skill_id: String,
        effects: Vec<Effect>,
    },
    /// Owning skill declared `session.continue`.
    SkillContinued {
        session_id: String,
        skill_id: String,
        effects: Vec<Effect>,
        expects_response: bool,
    },
    /// A consulted fallback skill accepted or declined the utterance.
    FallbackResolved {
        session_id: String,
        skill_id: String,
        handled: bool,
    },
    /// Audio collaborator started speaking a line.
    SpeechStarted { session_id: String },
    /// Audio collaborator finished speaking a line.
    SpeechFinished { session_id: String },
    /// GUI collaborator acknowledged a page (best-effort; not gating).
    GuiPageShown { session_id: String },
    /// A timer armed by an earlier directive fired.
    TimerFired {
        kind: TimerKind,
        session_id: String,
    },
    /// A skill's bus connection dropped or its heartbeats lapsed.
    SkillLost { skill_id: String },
}

/// Output of the state machine, executed by the service loop.
#[derive(Debug, Clone)]
pub enum Directive {
    /// Publish a message on the bus.
    Publish(Message),
    /// Arm the session's timer. Replaces any previously armed timer.
    StartTimer {
        kind: TimerKind,
        session_id: String,
        after: Duration,
    },
    /// Cancel whatever timer the session has armed.
    CancelTimers { session_id: String },
}

/// Matching facilities the manager consults while routing an utterance.
///
/// Implemented over the registry + matcher pair; tests substitute their own.
pub trait IntentResolver {
    /// Best match for an utterance, if any reaches the threshold.
    fn resolve(&self, utterance: &str) -> Option<IntentMatch>;
    /// Current registration generation for a skill.
    fn current_generation(&self, skill_id: &str) -> Option<u64>;
    /// Ordered fallback chain of live skill ids.
    fn fallback_chain(&self) -> Vec<String>;
}

/// What happens once a session's declared effects have drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostDrain {
    /// Arm the idle timer; the session is over.
    End,
    /// Trigger a listen and await the user's follow-up.
    ExpectFollowUp,
    /// Stay active; the skill will respond again later.
    ContinueActive,
}

/// One conversational turn-sequence.
#[derive(Debug)]
pub struct Session {
    /// Opaque unique token for this session.
    pub session_id: String,
    /// Skill currently owning the session, once matched.
    pub owner_skill_id: Option<String>,
    /// Lifecycle state.
    pub state: SessionState,
    /// True while the next utterance is routed straight to the owner.
    pub expects_follow_up: bool,
    /// When the session was created.
    pub created_at: Instant,
    /// Effects declared but not yet dispatched.
    pub pending_effects: VecDeque<Effect>,
    /// Parent session id when this session was created by delegation.
    pub delegate_of: Option<String>,
    /// True if the session was cut short (timeout, error, preemption).
    pub aborted: bool,
    /// Skills an abnormal ending is attributed to, for diagnostics.
    pub attributed_to: Vec<String>,

    /// Skill that delegated to this session, for timeout attribution.
    delegated_by: Option<String>,
    /// A `speak` is with the audio service; hold further Speak effects.
    speak_in_flight: bool,
    /// Set while a drain is in progress; cleared by `drain_complete`.
    post_drain: Option<PostDrain>,
    /// Fallback skills still to consult, in chain order.
    pending_fallbacks: VecDeque<String>,
    /// Fallback skill whose verdict is outstanding.
    awaiting_fallback: Option<String>,
    /// Utterance being matched, kept for fallback consultation.
    utterance: Option<String>,
}

impl Session {
    fn new(state: SessionState) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            owner_skill_id: None,
            state,
            expects_follow_up: false,
            created_at: Instant::now(),
            pending_effects: VecDeque::new(),
            delegate_of: None,
            aborted: false,
            attributed_to: Vec::new(),
            delegated_by: None,
            speak_in_flight: false,
            post_drain: None,
            pending_fallbacks: VecDeque::new(),
            awaiting_fallback: None,
            utterance: None,
        }
    }

    fn accepts_utterance_for(&self, session_id: Option<&str>) -> bool {
        match session_id {
            None => true,
            Some(id) => id == self.session_id,
        }
    }
}

/// The session manager: single owned current-session value, no locking.
pub struct SessionManager {
    config: SessionConfig,
    current: Option<Session>,
}

impl SessionManager {
    /// Create a manager in the Idle state.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Current lifecycle state (Idle when no session exists).
    pub fn state(&self) -> SessionState {
        self.current.as_ref().map_or(SessionState::Idle, |s| s.state)
    }

    /// The current session, if one exists.
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Feed one event through the state machine, returning the directives
    /// the service loop must execute. Run-to-completion: no I/O happens
    /// here.
    pub fn handle_event(
        &mut self,
        event: SessionEvent,
        resolver: &dyn IntentResolver,
    ) -> Vec<Directive> {
        let mut out = Vec::new();
        match event {
            SessionEvent::ListenTriggered => self.on_listen(&mut out),
            SessionEvent::UtteranceReceived { text, session_id } => {
                self.on_utterance(&text, session_id.as_deref(), resolver, &mut out);
            }
            SessionEvent::SkillEnded {
                session_id,
                skill_id,
                effects,
            } => self.on_skill_ended(&session_id, &skill_id, effects, &mut out),
            SessionEvent::SkillContinued {
                session_id,
                skill_id,
                effects,
                expects_response,
            } => self.on_skill_continued(&session_id, &skill_id, effects, expects_response, &mut out),
            SessionEvent::FallbackResolved {
                session_id,
                skill_id,
                handled,
            } => self.on_fallback_resolved(&session_id, &skill_id, handled, &mut out),
            SessionEvent::SpeechStarted { session_id } => {
                debug!(%session_id, "speech started");
            }
            SessionEvent::SpeechFinished { session_id } => {
                self.on_speech_finished(&session_id, &mut out);
            }
            SessionEvent::GuiPageShown { session_id } => {
                debug!(%session_id, "gui page shown");
            }
            SessionEvent::TimerFired { kind, session_id } => {
                self.on_timer(kind, &session_id, &mut out);
            }
            SessionEvent::SkillLost { skill_id } => self.on_skill_lost(&skill_id, &mut out),
        }
        out
    }

    // ── Listen / utterance ───────────────────────────────────────────────

    fn on_listen(&mut self, out: &mut Vec<Directive>) {
        self.preempt_current(out);
        let session = Session::new(SessionState::Listening);
        info!(session_id = %session.session_id, "session started, listening");
        out.push(publish(
            message(topics::SESSION_STARTED, json!({ "session_id": session.session_id }))
                .for_session(&session.session_id),
        ));
        self.current = Some(session);
    }

    fn on_utterance(
        &mut self,
        text: &str,
        session_id: Option<&str>,
        resolver: &dyn IntentResolver,
        out: &mut Vec<Directive>,
    ) {
        enum Route {
            FollowUp,
            Match,
            NewSession,
            Ignore(SessionState),
        }

        let route = match &self.current {
            Some(s) if !s.accepts_utterance_for(session_id) => Route::Ignore(s.state),
            Some(s) if s.state == SessionState::AwaitingFollowUp => Route::FollowUp,
            Some(s) if s.state == SessionState::Listening => Route::Match,
            Some(s) => Route::Ignore(s.state),
            None => Route::NewSession,
        };

        match route {
            Route::FollowUp => self.deliver_follow_up(text, out),
            Route::Match => {
                if let Some(session) = self.current.as_mut() {
                    session.state = SessionState::Matching;
                }
                self.run_match(text, resolver, out);
            }
            Route::NewSession => {
                // An utterance with no active session (text injection, CLI)
                // creates one directly in Matching.
                let session = Session::new(SessionState::Matching);
                info!(session_id = %session.session_id, "session started from bare utterance");
                out.push(publish(
                    message(
                        topics::SESSION_STARTED,
                        json!({ "session_id": session.session_id }),
                    )
                    .for_session(&session.session_id),
                ));
                self.current = Some(session);
                self.run_match(text, resolver, out);
            }
            Route::Ignore(state) => {
                debug!(
                    ?state,
                    tagged = ?session_id,
                    "ignoring utterance not addressed to current session"
                );
            }
        }
    }

    fn deliver_follow_up(&mut self, text: &str, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let Some(owner) = session.owner_skill_id.clone() else {
            warn!("follow-up expected but session has no owner");
            return;
        };
        debug!(
            session_id = %session.session_id,
            skill_id = %owner,
            "routing follow-up utterance to owning skill"
        );
        session.state = SessionState::Active;
        session.expects_follow_up = false;
        out.push(Directive::CancelTimers {
            session_id: session.session_id.clone(),
        });
        out.push(publish(
            message(
                &contract::raw_utterance_topic(&owner),
                json!({ "utterance": text, "session_id": session.session_id }),
            )
            .for_session(&session.session_id)
            .from_skill(&owner),
        ));
        out.push(Directive::StartTimer {
            kind: TimerKind::SkillResponse,
            session_id: session.session_id.clone(),
            after: Duration::from_secs(self.config.skill_response_timeout_secs),
        });
    }

    fn run_match(
        &mut self,
        text: &str,
        resolver: &dyn IntentResolver,
        out: &mut Vec<Directive>,
    ) {
        // Discard matches resolved against a registration that has since
        // changed: the skill may have restarted with different behavior.
        // One re-match against the current registry, then give up.
        let fresh = resolver.resolve(text).and_then(|m| {
            if resolver.current_generation(&m.skill_id) == Some(m.generation) {
                Some(m)
            } else {
                warn!(skill_id = %m.skill_id, "discarding stale intent match, re-matching");
                resolver
                    .resolve(text)
                    .filter(|m2| resolver.current_generation(&m2.skill_id) == Some(m2.generation))
            }
        });

        match fresh {
            Some(m) => self.dispatch_intent(&m, text, out),
            None => {
                let Some(session) = self.current.as_mut() else {
                    return;
                };
                session.utterance = Some(text.to_owned());
                session.pending_fallbacks = resolver.fallback_chain().into();
                self.advance_fallback(out);
            }
        }
    }

    fn dispatch_intent(&mut self, m: &IntentMatch, text: &str, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        info!(
            session_id = %session.session_id,
            skill_id = %m.skill_id,
            intent = %m.intent_name,
            score = m.score,
            "dispatching intent"
        );
        session.owner_skill_id = Some(m.skill_id.clone());
        session.state = SessionState::Active;
        let slots: Map<String, Value> = m
            .slots
            .iter()
            .map(|(tag, phrase)| (tag.clone(), Value::String(phrase.clone())))
            .collect();
        out.push(publish(
            message(
                &contract::intent_invoke_topic(&m.skill_id, &m.intent_name),
                json!({ "utterance": text, "slots": slots }),
            )
            .for_session(&session.session_id)
            .from_skill(&m.skill_id),
        ));
        out.push(Directive::StartTimer {
            kind: TimerKind::SkillResponse,
            session_id: session.session_id.clone(),
            after: Duration::from_secs(self.config.skill_response_timeout_secs),
        });
    }

    // ── Fallback chain ───────────────────────────────────────────────────

    fn advance_fallback(&mut self, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        match session.pending_fallbacks.pop_front() {
            Some(skill_id) => {
                debug!(
                    session_id = %session.session_id,
                    %skill_id,
                    "consulting fallback skill"
                );
                session.awaiting_fallback = Some(skill_id.clone());
                let utterance = session.utterance.clone().unwrap_or_default();
                out.push(publish(
                    message(
                        &contract::fallback_request_topic(&skill_id),
                        json!({ "utterance": utterance, "session_id": session.session_id }),
                    )
                    .for_session(&session.session_id)
                    .from_skill(&skill_id),
                ));
                out.push(Directive::StartTimer {
                    kind: TimerKind::FallbackResponse,
                    session_id: session.session_id.clone(),
                    after: Duration::from_secs(self.config.fallback_response_timeout_secs),
                });
            }
            None => {
                // No intent and no fallback could help. The session still
                // completes normally, with an "unknown" spoken effect.
                info!(session_id = %session.session_id, "no intent matched");
                let dialog = self.config.unknown_dialog.clone();
                self.finish_session(
                    vec![Effect::speak_dialog(dialog, "Sorry, I can't help with that.")],
                    false,
                    Vec::new(),
                    out,
                );
            }
        }
    }

    fn on_fallback_resolved(
        &mut self,
        session_id: &str,
        skill_id: &str,
        handled: bool,
        out: &mut Vec<Directive>,
    ) {
        let Some(session) = self.current.as_mut() else {
            debug!(%session_id, "fallback response with no session");
            return;
        };
        if session.session_id != session_id
            || session.state != SessionState::Matching
            || session.awaiting_fallback.as_deref() != Some(skill_id)
        {
            debug!(%session_id, %skill_id, "ignoring unexpected fallback response");
            return;
        }
        session.awaiting_fallback = None;
        out.push(Directive::CancelTimers {
            session_id: session.session_id.clone(),
        });
        if handled {
            info!(
                session_id = %session.session_id,
                %skill_id,
                "fallback skill accepted utterance"
            );
            session.owner_skill_id = Some(skill_id.to_owned());
            session.state = SessionState::Active;
            out.push(Directive::StartTimer {
                kind: TimerKind::SkillResponse,
                session_id: session.session_id.clone(),
                after: Duration::from_secs(self.config.skill_response_timeout_secs),
            });
        } else {
            self.advance_fallback(out);
        }
    }

    // ── Skill responses ──────────────────────────────────────────────────

    fn owner_guard(&self, session_id: &str, skill_id: &str) -> bool {
        let Some(session) = self.current.as_ref() else {
            debug!(%session_id, "skill response with no session");
            return false;
        };
        if session.session_id != session_id {
            debug!(%session_id, "skill response for a session that is gone");
            return false;
        }
        if !matches!(
            session.state,
            SessionState::Active | SessionState::AwaitingFollowUp
        ) {
            debug!(state = ?session.state, "skill response in unexpected state");
            return false;
        }
        if session.owner_skill_id.as_deref() != Some(skill_id) {
            warn!(
                %skill_id,
                owner = ?session.owner_skill_id,
                "skill response from non-owner, ignoring"
            );
            return false;
        }
        true
    }

    fn on_skill_ended(
        &mut self,
        session_id: &str,
        skill_id: &str,
        effects: Vec<Effect>,
        out: &mut Vec<Directive>,
    ) {
        if !self.owner_guard(session_id, skill_id) {
            return;
        }
        debug!(%session_id, %skill_id, effects = effects.len(), "skill ended session");
        self.finish_session(effects, false, Vec::new(), out);
    }

    fn on_skill_continued(
        &mut self,
        session_id: &str,
        skill_id: &str,
        effects: Vec<Effect>,
        expects_response: bool,
        out: &mut Vec<Directive>,
    ) {
        if !self.owner_guard(session_id, skill_id) {
            return;
        }
        let Some(session) = self.current.as_mut() else {
            return;
        };
        debug!(
            %session_id,
            %skill_id,
            expects_response,
            "skill continued session"
        );
        session.state = SessionState::Active;
        session.expects_follow_up = expects_response;
        session.pending_effects = effects.into();
        session.post_drain = Some(if expects_response {
            PostDrain::ExpectFollowUp
        } else {
            PostDrain::ContinueActive
        });
        out.push(Directive::CancelTimers {
            session_id: session.session_id.clone(),
        });
        self.pump_effects(out);
    }

    /// Move the current session to Ending with the given effects and start
    /// draining them.
    fn finish_session(
        &mut self,
        effects: Vec<Effect>,
        aborted: bool,
        attributed_to: Vec<String>,
        out: &mut Vec<Directive>,
    ) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        session.state = SessionState::Ending;
        session.aborted = aborted;
        session.attributed_to = attributed_to;
        session.pending_effects = effects.into();
        session.post_drain = Some(PostDrain::End);
        out.push(Directive::CancelTimers {
            session_id: session.session_id.clone(),
        });
        self.pump_effects(out);
    }

    // ── Effect drain ─────────────────────────────────────────────────────

    /// Dispatch pending effects in declaration order. GUI effects are
    /// fire-and-forget; a waiting Speak holds the queue until the audio
    /// collaborator reports `speech.finished`.
    fn pump_effects(&mut self, out: &mut Vec<Directive>) {
        loop {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            if session.speak_in_flight {
                return;
            }
            let Some(effect) = session.pending_effects.pop_front() else {
                break;
            };
            match effect {
                Effect::Speak {
                    dialog_id,
                    text,
                    wait,
                } => {
                    out.push(publish(
                        message(
                            topics::SPEAK,
                            json!({
                                "session_id": session.session_id,
                                "text": text,
                                "dialog_id": dialog_id,
                                "skill_id": session.owner_skill_id,
                            }),
                        )
                        .for_session(&session.session_id),
                    ));
                    if wait {
                        session.speak_in_flight = true;
                        // Let the audio service pre-synthesize the next line
                        // while this one plays.
                        if let Some(Effect::Speak { text: next, .. }) = session
                            .pending_effects
                            .iter()
                            .find(|e| matches!(e, Effect::Speak { .. }))
                        {
                            out.push(publish(
                                message(
                                    topics::SPEAK_CACHE,
                                    json!({
                                        "session_id": session.session_id,
                                        "text": next,
                                    }),
                                )
                                .for_session(&session.session_id),
                            ));
                        }
                        return;
                    }
                }
                Effect::ShowPage { page_id, data } => {
                    out.push(publish(
                        message(
                            topics::GUI_SHOW_PAGE,
                            json!({
                                "session_id": session.session_id,
                                "page_id": page_id,
                                "data": data,
                            }),
                        )
                        .for_session(&session.session_id),
                    ));
                }
                Effect::ClearGui => {
                    out.push(publish(
                        message(
                            topics::GUI_CLEAR,
                            json!({ "session_id": session.session_id }),
                        )
                        .for_session(&session.session_id),
                    ));
                }
                Effect::Delegate {
                    child_skill_id,
                    data,
                } => {
                    self.delegate_to(&child_skill_id, data, out);
                    return;
                }
            }
        }
        self.drain_complete(out);
    }

    fn drain_complete(&mut self, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let Some(post) = session.post_drain.take() else {
            return;
        };
        out.push(publish(
            message(
                topics::SESSION_EFFECTS_COMPLETED,
                json!({ "session_id": session.session_id }),
            )
            .for_session(&session.session_id),
        ));
        match post {
            PostDrain::End => {
                // Idle reversion waits out the GUI idle timeout; a new
                // session starting first cancels it.
                out.push(Directive::StartTimer {
                    kind: TimerKind::Idle,
                    session_id: session.session_id.clone(),
                    after: Duration::from_secs(self.config.gui_idle_timeout_secs),
                });
            }
            PostDrain::ExpectFollowUp => {
                session.state = SessionState::AwaitingFollowUp;
                let owner = session.owner_skill_id.clone();
                out.push(publish(
                    message(
                        topics::LISTEN,
                        json!({
                            "session_id": session.session_id,
                            "response_skill_id": owner,
                        }),
                    )
                    .for_session(&session.session_id),
                ));
                out.push(publish(
                    message(
                        topics::SESSION_CONTINUED,
                        json!({ "session_id": session.session_id }),
                    )
                    .for_session(&session.session_id),
                ));
                out.push(Directive::StartTimer {
                    kind: TimerKind::FollowUp,
                    session_id: session.session_id.clone(),
                    after: Duration::from_secs(self.config.follow_up_timeout_secs),
                });
            }
            PostDrain::ContinueActive => {
                session.state = SessionState::Active;
                out.push(publish(
                    message(
                        topics::SESSION_CONTINUED,
                        json!({ "session_id": session.session_id }),
                    )
                    .for_session(&session.session_id),
                ));
                out.push(Directive::StartTimer {
                    kind: TimerKind::SkillResponse,
                    session_id: session.session_id.clone(),
                    after: Duration::from_secs(self.config.skill_response_timeout_secs),
                });
            }
        }
    }

    // ── Delegation ───────────────────────────────────────────────────────

    /// Replace the current session with a child session owned by
    /// `child_skill_id`. The child, not the parent, must now end it.
    fn delegate_to(
        &mut self,
        child_skill_id: &str,
        data: Map<String, Value>,
        out: &mut Vec<Directive>,
    ) {
        let Some(parent) = self.current.take() else {
            return;
        };
        if !parent.pending_effects.is_empty() {
            debug!(
                dropped = parent.pending_effects.len(),
                "delegate was not the last declared effect; dropping the rest"
            );
        }
        out.push(Directive::CancelTimers {
            session_id: parent.session_id.clone(),
        });

        let mut child = Session::new(SessionState::Active);
        child.owner_skill_id = Some(child_skill_id.to_owned());
        child.delegate_of = Some(parent.session_id.clone());
        child.delegated_by = parent.owner_skill_id.clone();
        // An in-flight parent line keeps playing; its completion event will
        // not match the child session and is ignored.
        info!(
            parent_session_id = %parent.session_id,
            child_session_id = %child.session_id,
            %child_skill_id,
            "session delegated"
        );
        out.push(publish(
            message(
                topics::SESSION_DELEGATED,
                json!({
                    "parent_session_id": parent.session_id,
                    "child_session_id": child.session_id,
                    "child_skill_id": child_skill_id,
                }),
            )
            .for_session(&child.session_id),
        ));
        out.push(publish(
            message(
                &contract::delegate_invoke_topic(child_skill_id),
                json!({
                    "parent_skill_id": parent.owner_skill_id,
                    "session_id": child.session_id,
                    "data": data,
                }),
            )
            .for_session(&child.session_id)
            .from_skill(child_skill_id),
        ));
        out.push(Directive::StartTimer {
            kind: TimerKind::Delegation,
            session_id: child.session_id.clone(),
            after: Duration::from_secs(self.config.delegation_timeout_secs),
        });
        self.current = Some(child);
    }

    // ── Completion signals ───────────────────────────────────────────────

    fn on_speech_finished(&mut self, session_id: &str, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            debug!(%session_id, "speech finished with no session, ignoring");
            return;
        };
        if session.session_id != session_id {
            debug!(%session_id, "speech finished for a session that is gone, ignoring");
            return;
        }
        if !session.speak_in_flight {
            // Duplicate delivery; the state machine already moved on.
            debug!(%session_id, "duplicate speech finished, ignoring");
            return;
        }
        session.speak_in_flight = false;
        self.pump_effects(out);
    }

    // ── Timers ───────────────────────────────────────────────────────────

    fn on_timer(&mut self, kind: TimerKind, session_id: &str, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_ref() else {
            return;
        };
        if session.session_id != session_id {
            debug!(?kind, %session_id, "stale timer, ignoring");
            return;
        }
        // A timer expiry can race its own cancellation: the service task may
        // deliver it after the session already moved on. Each kind is only
        // meaningful in the state it was armed in.
        match kind {
            TimerKind::SkillResponse => {
                if session.state != SessionState::Active {
                    debug!(%session_id, state = ?session.state, "stale response timer, ignoring");
                    return;
                }
                let owner = session.owner_skill_id.clone();
                warn!(
                    %session_id,
                    skill_id = ?owner,
                    "owning skill did not respond in time"
                );
                let dialog = self.config.error_dialog.clone();
                self.finish_session(
                    vec![Effect::speak_dialog(dialog, "Sorry, something went wrong.")],
                    true,
                    owner.into_iter().collect(),
                    out,
                );
            }
            TimerKind::FollowUp => {
                if session.state != SessionState::AwaitingFollowUp {
                    debug!(%session_id, state = ?session.state, "stale follow-up timer, ignoring");
                    return;
                }
                debug!(%session_id, "no follow-up utterance arrived");
                let owner = session.owner_skill_id.clone();
                let dialog = self.config.error_dialog.clone();
                self.finish_session(
                    vec![Effect::speak_dialog(dialog, "Sorry, something went wrong.")],
                    true,
                    owner.into_iter().collect(),
                    out,
                );
            }
            TimerKind::Delegation => {
                if !matches!(
                    session.state,
                    SessionState::Active | SessionState::AwaitingFollowUp
                ) {
                    debug!(%session_id, state = ?session.state, "stale delegation timer, ignoring");
                    return;
                }
                // Attributed to both parent and child for observability.
                let mut attributed: Vec<String> =
                    session.delegated_by.iter().cloned().collect();
                attributed.extend(session.owner_skill_id.clone());
                warn!(
                    %session_id,
                    attributed = ?attributed,
                    "delegated child never ended the session, force-ending"
                );
                let dialog = self.config.error_dialog.clone();
                self.finish_session(
                    vec![
                        Effect::speak_dialog(dialog, "Sorry, something went wrong."),
                        Effect::ClearGui,
                    ],
                    true,
                    attributed,
                    out,
                );
            }
            TimerKind::FallbackResponse => {
                if session.state != SessionState::Matching || session.awaiting_fallback.is_none()
                {
                    debug!(%session_id, state = ?session.state, "stale fallback timer, ignoring");
                    return;
                }
                debug!(%session_id, "fallback skill did not answer, treating as declined");
                if let Some(session) = self.current.as_mut() {
                    session.awaiting_fallback = None;
                }
                self.advance_fallback(out);
            }
            TimerKind::Idle => {
                if session.state != SessionState::Ending || session.post_drain.is_some() {
                    debug!(%session_id, "idle timer in unexpected state, ignoring");
                    return;
                }
                self.revert_to_idle(out);
            }
        }
    }

    /// Final `Ending → Idle` transition: idle screen, ended announcement,
    /// session destroyed.
    fn revert_to_idle(&mut self, out: &mut Vec<Directive>) {
        let Some(session) = self.current.take() else {
            return;
        };
        info!(session_id = %session.session_id, aborted = session.aborted, "session idle");
        out.push(publish(
            message(
                topics::GUI_IDLE,
                json!({ "session_id": session.session_id }),
            )
            .for_session(&session.session_id),
        ));
        out.push(publish(session_ended(&session)));
    }

    // ── Preemption / loss ────────────────────────────────────────────────

    /// A new session is starting: whatever exists now is torn down. Queued
    /// effects are dropped, but an in-flight spoken line is not cut off —
    /// its completion event simply no longer matches any session.
    fn preempt_current(&mut self, out: &mut Vec<Directive>) {
        let Some(mut session) = self.current.take() else {
            return;
        };
        out.push(Directive::CancelTimers {
            session_id: session.session_id.clone(),
        });
        let drained = session.post_drain.is_none() && session.state == SessionState::Ending;
        if !drained {
            session.aborted = true;
        }
        info!(
            session_id = %session.session_id,
            aborted = session.aborted,
            "session preempted by new listen"
        );
        out.push(publish(session_ended(&session)));
    }

    fn on_skill_lost(&mut self, skill_id: &str, out: &mut Vec<Directive>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if session.awaiting_fallback.as_deref() == Some(skill_id) {
            debug!(%skill_id, "fallback skill lost, advancing chain");
            session.awaiting_fallback = None;
            out.push(Directive::CancelTimers {
                session_id: session.session_id.clone(),
            });
            self.advance_fallback(out);
            return;
        }
        if session.owner_skill_id.as_deref() == Some(skill_id)
            && matches!(
                session.state,
                SessionState::Active | SessionState::AwaitingFollowUp
            )
        {
            warn!(%skill_id, "owning skill lost, force-ending session");
            let dialog = self.config.error_dialog.clone();
            self.finish_session(
                vec![Effect::speak_dialog(dialog, "Sorry, something went wrong.")],
                true,
                vec![skill_id.to_owned()],
                out,
            );
        }
    }
}

// ── Directive helpers ────────────────────────────────────────────────────

fn publish(message: Message) -> Directive {
    Directive::Publish(message)
}

/// Build a message from a type and a `json!` object literal.
fn message(msg_type: &str, data: Value) -> Message {
    let data = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Message {
        msg_type: msg_type.to_owned(),
        data,
        context: Default::default(),
    }
}

fn session_ended(session: &Session) -> Message {
    let payload = SessionEndedPayload {
        aborted: session.aborted,
        attributed_to: session.attributed_to.clone(),
    };
    let mut data = Map::new();
    data.insert(
        "session_id".to_owned(),
        Value::String(session.session_id.clone()),
    );
    if let Ok(Value::Object(fields)) = serde_json::to_value(&payload) {
        data.extend(fields);
    }
    Message {
        msg_type: topics::SESSION_ENDED.to_owned(),
        data,
        context: Default::default(),
    }
    .for_session(&session.session_id)
}
