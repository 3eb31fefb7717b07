//! The intent service: glue between the bus, the skill registry, the
//! matcher, and the session state machine.
//!
//! One task owns everything — registry, matcher, session manager — so event
//! handling is strictly sequential and needs no locking. Bus messages come
//! in through a wildcard subscription, get translated to registry calls or
//! [`SessionEvent`]s, and the resulting [`Directive`]s are executed here:
//! publishes go straight back to the bus, timers become cancellable spawned
//! sleeps that feed `TimerFired` back into the same loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, Message};
use crate::config::SkaldConfig;
use crate::contract::{
    topics, ContinueSessionPayload, EndSessionPayload, FallbackResponsePayload,
    RegisterFallbackPayload, RegisterPayload,
};
use crate::error::Result;
use crate::intent::{IntentMatch, IntentMatcher};
use crate::registry::SkillRegistry;
use crate::session::{Directive, IntentResolver, SessionEvent, SessionManager, TimerKind};

/// Resolver view handed to the session manager for the duration of one
/// event.
struct RegistryResolver<'a> {
    registry: &'a SkillRegistry,
    matcher: &'a IntentMatcher,
}

impl IntentResolver for RegistryResolver<'_> {
    fn resolve(&self, utterance: &str) -> Option<IntentMatch> {
        self.matcher
            .match_utterance(utterance, &self.registry.intents_for_match())
    }

    fn current_generation(&self, skill_id: &str) -> Option<u64> {
        self.registry.generation_of(skill_id)
    }

    fn fallback_chain(&self) -> Vec<String> {
        self.registry.fallback_chain()
    }
}

/// An armed session timer. The id disambiguates a raced expiry from a timer
/// armed later for the same session.
struct ArmedTimer {
    id: u64,
    token: CancellationToken,
}

/// The session/intent coordination service.
pub struct IntentService {
    bus: BusClient,
    config: SkaldConfig,
    registry: SkillRegistry,
    matcher: IntentMatcher,
    manager: SessionManager,
    timers: HashMap<String, ArmedTimer>,
    next_timer_id: u64,
    timer_tx: mpsc::UnboundedSender<(u64, TimerKind, String)>,
    timer_rx: Option<mpsc::UnboundedReceiver<(u64, TimerKind, String)>>,
}

impl IntentService {
    /// Build the service against a bus handle.
    pub fn new(config: SkaldConfig, bus: BusClient) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            registry: SkillRegistry::new(&config.registry),
            matcher: IntentMatcher::new(&config.matcher),
            manager: SessionManager::new(config.session.clone()),
            timers: HashMap::new(),
            next_timer_id: 0,
            timer_tx,
            timer_rx: Some(timer_rx),
            config,
        }
    }

    /// Read-only view of the session manager, for diagnostics.
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Run until cancelled. Consumes all bus traffic, timer expiries, and
    /// the periodic heartbeat sweep.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.bus.subscribe("*");
        let mut timer_rx = match self.timer_rx.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.registry.heartbeat_interval_secs,
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("intent service running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("intent service shutting down");
                    break;
                }
                message = sub.recv() => {
                    let Some(message) = message else { break };
                    self.handle_message(&message);
                }
                expiry = timer_rx.recv() => {
                    let Some((id, kind, session_id)) = expiry else { break };
                    self.on_timer_fired(id, kind, session_id);
                }
                _ = sweep.tick() => self.sweep_heartbeats(),
            }
        }

        for (_, armed) in self.timers.drain() {
            armed.token.cancel();
        }
        Ok(())
    }

    /// Translate one bus message into registry updates or a session event.
    ///
    /// Public so tests can drive the service synchronously.
    pub fn handle_message(&mut self, message: &Message) {
        let session_id = message.context.session_id.clone();
        let skill_id = message.context.skill_id.clone();

        match message.msg_type.as_str() {
            topics::WAKEWORD => self.dispatch(SessionEvent::ListenTriggered),
            topics::LISTEN => {
                // A listen the manager itself requested for a follow-up is
                // directed at a skill; only undirected listens start a new
                // session.
                if message.data_str("response_skill_id").is_none() {
                    self.dispatch(SessionEvent::ListenTriggered);
                }
            }
            topics::UTTERANCE => {
                let Some(text) = utterance_text(message) else {
                    warn!("utterance message without text, dropping");
                    return;
                };
                self.dispatch(SessionEvent::UtteranceReceived { text, session_id });
            }
            topics::SKILL_REGISTER => match parse::<RegisterPayload>(message) {
                Ok(payload) => {
                    self.registry.register(
                        &payload.skill_id,
                        payload.intents,
                        payload.vocabulary,
                        Instant::now(),
                    );
                }
                Err(e) => warn!(error = %e, "bad skill.register payload"),
            },
            topics::SKILL_HEARTBEAT => {
                if let Some(id) = skill_in(message) {
                    self.registry.heartbeat(&id, Instant::now());
                }
            }
            topics::SKILL_DEREGISTER => {
                if let Some(id) = skill_in(message) {
                    self.registry.deregister(&id);
                    self.dispatch(SessionEvent::SkillLost { skill_id: id });
                }
            }
            topics::SKILL_DISCONNECTED => {
                if let Some(id) = skill_in(message) {
                    self.registry.deregister(&id);
                    self.dispatch(SessionEvent::SkillLost { skill_id: id });
                }
            }
            topics::SKILL_DETACH_INTENT => {
                if let (Some(id), Some(intent)) = (skill_in(message), message.data_str("intent"))
                {
                    self.registry.detach_intent(&id, intent);
                }
            }
            topics::SKILL_DETACH_SKILL => {
                if let Some(id) = skill_in(message) {
                    self.registry.detach_skill(&id);
                }
            }
            topics::SKILL_REGISTER_FALLBACK => match parse::<RegisterFallbackPayload>(message) {
                Ok(payload) => self.registry.register_fallback(&payload.skill_id, payload.priority),
                Err(e) => warn!(error = %e, "bad skill.register_fallback payload"),
            },
            topics::SESSION_END => {
                let (Some(session_id), Some(skill_id)) = (session_id, skill_id) else {
                    warn!("session.end without session/skill context, dropping");
                    return;
                };
                match parse::<EndSessionPayload>(message) {
                    Ok(payload) => self.dispatch(SessionEvent::SkillEnded {
                        session_id,
                        skill_id,
                        effects: payload.effects,
                    }),
                    Err(e) => warn!(error = %e, "bad session.end payload"),
                }
            }
            topics::SESSION_CONTINUE => {
                let (Some(session_id), Some(skill_id)) = (session_id, skill_id) else {
                    warn!("session.continue without session/skill context, dropping");
                    return;
                };
                match parse::<ContinueSessionPayload>(message) {
                    Ok(payload) => self.dispatch(SessionEvent::SkillContinued {
                        session_id,
                        skill_id,
                        effects: payload.effects,
                        expects_response: payload.expects_response,
                    }),
                    Err(e) => warn!(error = %e, "bad session.continue payload"),
                }
            }
            topics::FALLBACK_RESPONSE => {
                let (Some(session_id), Some(skill_id)) = (session_id, skill_id) else {
                    debug!("fallback.response without context, dropping");
                    return;
                };
                let handled = parse::<FallbackResponsePayload>(message)
                    .map(|p| p.handled)
                    .unwrap_or(false);
                self.dispatch(SessionEvent::FallbackResolved {
                    session_id,
                    skill_id,
                    handled,
                });
            }
            topics::SPEECH_STARTED => {
                if let Some(session_id) = session_id {
                    self.dispatch(SessionEvent::SpeechStarted { session_id });
                }
            }
            topics::SPEECH_FINISHED => {
                if let Some(session_id) = session_id {
                    self.dispatch(SessionEvent::SpeechFinished { session_id });
                }
            }
            topics::GUI_PAGE_SHOWN => {
                if let Some(session_id) = session_id {
                    self.dispatch(SessionEvent::GuiPageShown { session_id });
                }
            }
            _ => {}
        }
    }

    /// A spawned timer's expiry arrived. An expiry can race its own
    /// cancellation: if the session's armed timer is no longer this one, the
    /// expiry is stale and must not touch the newer timer's bookkeeping.
    fn on_timer_fired(&mut self, id: u64, kind: TimerKind, session_id: String) {
        match self.timers.get(&session_id) {
            Some(armed) if armed.id == id => {
                self.timers.remove(&session_id);
                self.dispatch(SessionEvent::TimerFired { kind, session_id });
            }
            _ => debug!(?kind, %session_id, "stale timer expiry, dropping"),
        }
    }

    /// Mark lapsed skills not-alive and tear down their session if they own
    /// one.
    fn sweep_heartbeats(&mut self) {
        let lapsed = self.registry.prune(Instant::now());
        for skill_id in lapsed {
            self.bus.publish(
                &Message {
                    msg_type: topics::SKILL_DISCONNECTED.to_owned(),
                    data: serde_json::Map::from_iter([(
                        "reason".to_owned(),
                        Value::String("heartbeat".to_owned()),
                    )]),
                    context: Default::default(),
                }
                .from_skill(&skill_id),
            );
            self.dispatch(SessionEvent::SkillLost { skill_id });
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let resolver = RegistryResolver {
            registry: &self.registry,
            matcher: &self.matcher,
        };
        let directives = self.manager.handle_event(event, &resolver);
        self.execute(directives);
    }

    fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Publish(message) => self.bus.publish(&message),
                Directive::StartTimer {
                    kind,
                    session_id,
                    after,
                } => self.arm_timer(kind, session_id, after),
                Directive::CancelTimers { session_id } => {
                    if let Some(token) = self.timers.remove(&session_id) {
                        token.token.cancel();
                    }
                }
            }
        }
    }

    /// Arm the session's single timer, replacing any previous one.
    fn arm_timer(&mut self, kind: TimerKind, session_id: String, after: Duration) {
        if let Some(previous) = self.timers.remove(&session_id) {
            previous.token.cancel();
        }
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let token = CancellationToken::new();
        self.timers.insert(
            session_id.clone(),
            ArmedTimer {
                id,
                token: token.clone(),
            },
        );

        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send((id, kind, session_id));
                }
            }
        });
    }
}

/// Extract the utterance text, accepting both the single-string form and
/// the STT batch form (`utterances: [...]`, first entry wins).
fn utterance_text(message: &Message) -> Option<String> {
    if let Some(text) = message.data_str("utterance") {
        return Some(text.to_owned());
    }
    message
        .data
        .get("utterances")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Skill id from the payload, falling back to the context.
fn skill_in(message: &Message) -> Option<String> {
    message
        .data_str("skill_id")
        .map(str::to_owned)
        .or_else(|| message.context.skill_id.clone())
}

fn parse<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T> {
    serde_json::from_value(Value::Object(message.data.clone()))
        .map_err(|e| crate::error::SkaldError::Wire(e.to_string()))
}
