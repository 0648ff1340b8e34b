//! Change stream lifecycle.
//!
//! [`StreamManager`] is a pure state machine: the engine feeds it
//! [`StreamInput`]s and carries out the [`StreamAction`]s it returns (opening
//! instances, arming timers, emitting connection events). Every opened
//! instance gets a fresh generation number and inputs that carry a stale
//! generation are ignored, so late events from a torn-down instance can never
//! affect its replacement.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ready──▶ Streaming
//!                            │  ▲                  │
//!                      error │  │ reconnect due    │ error
//!                            ▼  │                  │
//!                         Reconnecting ◀───────────┘
//!                            │
//!        attempts exhausted  │   init timeout (from Connecting)
//!                            ▼
//!                          Failed
//! ```

use std::time::Duration;

use sync_core::StreamPosition;

use crate::config::ReconnectPolicy;
use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    /// Instance `generation` is open and has not reported ready yet.
    Connecting { generation: u64 },
    Streaming { generation: u64 },
    /// Waiting out the backoff before reconnect attempt `attempt`.
    Reconnecting {
        attempt: u32,
        resume_from: Option<StreamPosition>,
    },
    /// Terminal after a fatal connection error.
    Failed,
    /// Terminal after the user ended the connection.
    Closed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Failed | StreamState::Closed)
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            StreamState::Connecting { generation } | StreamState::Streaming { generation } => {
                Some(*generation)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInput {
    Start,
    Ready { generation: u64 },
    /// Instance failed; `position` is what it reported before failing.
    Error {
        generation: u64,
        position: Option<StreamPosition>,
    },
    InitTimeout { generation: u64 },
    ReconnectDue,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    /// Open instance `generation` and arm its init deadline. `None` starts at
    /// the end of the log.
    Open {
        generation: u64,
        resume_from: Option<StreamPosition>,
    },
    CancelInitDeadline,
    CancelReconnect,
    /// Stop the instance and discard its events.
    TearDown { generation: u64 },
    ScheduleReconnect { attempt: u32, delay: Duration },
    EmitReady { resumed: bool },
    EmitFatal(ConnectionError),
}

#[derive(Debug)]
pub struct StreamManager {
    policy: ReconnectPolicy,
    state: StreamState,
    /// Reconnects since the last ready.
    reconnects: u32,
    next_generation: u64,
    /// Position the current instance was opened at.
    opened_from: Option<StreamPosition>,
    initial_resume: Option<StreamPosition>,
}

impl StreamManager {
    pub fn new(policy: ReconnectPolicy, resume_from: Option<StreamPosition>) -> Self {
        Self {
            policy,
            state: StreamState::Disconnected,
            reconnects: 0,
            next_generation: 1,
            opened_from: None,
            initial_resume: resume_from,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// `true` if `generation` is the instance currently connecting or streaming.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.generation() == Some(generation)
    }

    pub fn handle(&mut self, input: StreamInput) -> Vec<StreamAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match input {
            StreamInput::Start => match self.state {
                StreamState::Disconnected => {
                    let resume_from = self.initial_resume.take();
                    vec![self.open(resume_from)]
                }
                _ => Vec::new(),
            },

            StreamInput::Ready { generation } => match self.state {
                StreamState::Connecting { generation: g } if g == generation => {
                    let resumed = self.reconnects > 0;
                    self.reconnects = 0;
                    self.state = StreamState::Streaming { generation };
                    vec![
                        StreamAction::CancelInitDeadline,
                        StreamAction::EmitReady { resumed },
                    ]
                }
                _ => Vec::new(),
            },

            StreamInput::Error {
                generation,
                position,
            } => {
                if !self.is_current(generation) {
                    return Vec::new();
                }
                let mut actions = vec![
                    StreamAction::CancelInitDeadline,
                    StreamAction::TearDown { generation },
                ];

                if self.reconnects >= self.policy.max_attempts {
                    self.state = StreamState::Failed;
                    actions.push(StreamAction::EmitFatal(ConnectionError::ReconnectFailure {
                        attempts: self.reconnects,
                    }));
                    return actions;
                }

                let attempt = self.reconnects + 1;
                let delay = self.policy.delay_for(self.reconnects);
                let resume_from = position.or_else(|| self.opened_from.take());
                self.state = StreamState::Reconnecting {
                    attempt,
                    resume_from,
                };
                actions.push(StreamAction::ScheduleReconnect { attempt, delay });
                actions
            }

            StreamInput::InitTimeout { generation } => match self.state {
                StreamState::Connecting { generation: g } if g == generation => {
                    self.state = StreamState::Failed;
                    vec![
                        StreamAction::TearDown { generation },
                        StreamAction::EmitFatal(ConnectionError::InitTimeout),
                    ]
                }
                _ => Vec::new(),
            },

            StreamInput::ReconnectDue => {
                let StreamState::Reconnecting {
                    attempt,
                    resume_from,
                } = std::mem::replace(&mut self.state, StreamState::Disconnected)
                else {
                    return Vec::new();
                };
                self.reconnects = attempt;
                vec![self.open(resume_from)]
            }

            StreamInput::Close => {
                let mut actions = vec![
                    StreamAction::CancelInitDeadline,
                    StreamAction::CancelReconnect,
                ];
                if let Some(generation) = self.state.generation() {
                    actions.push(StreamAction::TearDown { generation });
                }
                self.state = StreamState::Closed;
                actions
            }
        }
    }

    fn open(&mut self, resume_from: Option<StreamPosition>) -> StreamAction {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.state = StreamState::Connecting { generation };
        self.opened_from = resume_from.clone();
        StreamAction::Open {
            generation,
            resume_from,
        }
    }
}
