//! Timer task derivation.
//!
//! The timer builder computes the next timer task(s) owed by a mutable
//! state: decision timeouts, the earliest unsatisfied user timer, the
//! earliest activity timeout and the retention-driven deletion task.
//! Marking a pending entry `task_created` keeps tasks one-to-one with
//! pending work: a timer task exists iff the entry is unfired and uncovered.

use crate::state::{DecisionInfo, MutableState};
use crate::{TimeoutKind, TimerTask, TimerTaskKind};

pub struct TimerBuilder {
    now_ms: i64,
}

impl TimerBuilder {
    pub fn new(now_ms: i64) -> Self {
        TimerBuilder { now_ms }
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Start-to-close timeout for a started decision attempt.
    pub fn add_start_to_close_decision_timeout_task(&self, di: &DecisionInfo) -> TimerTask {
        TimerTask {
            version: di.version,
            fire_at_ms: self.now_ms + di.decision_timeout_seconds as i64 * 1000,
            kind: TimerTaskKind::DecisionTimeout {
                schedule_id: di.schedule_id,
                attempt: di.attempt,
                timeout_kind: TimeoutKind::StartToClose,
            },
        }
    }

    /// Schedule-to-start timeout guarding sticky dispatch: if the sticky
    /// worker does not pick the decision up in time, it falls back to the
    /// normal task list.
    pub fn add_schedule_to_start_decision_timeout_task(
        &self,
        di: &DecisionInfo,
        timeout_seconds: i32,
    ) -> TimerTask {
        TimerTask {
            version: di.version,
            fire_at_ms: self.now_ms + timeout_seconds as i64 * 1000,
            kind: TimerTaskKind::DecisionTimeout {
                schedule_id: di.schedule_id,
                attempt: di.attempt,
                timeout_kind: TimeoutKind::ScheduleToStart,
            },
        }
    }

    /// Earliest pending user timer not yet covered by a task.
    pub fn get_user_timer_task_if_needed(&self, ms: &mut MutableState) -> Option<TimerTask> {
        let candidate = ms
            .pending_timers()
            .filter(|ti| !ti.task_created)
            .min_by_key(|ti| ti.fire_at_ms)
            .map(|ti| ti.timer_id.clone())?;
        let ti = ms
            .pending_timers_mut()
            .find(|ti| ti.timer_id == candidate)?;
        ti.task_created = true;
        Some(TimerTask {
            version: ti.version,
            fire_at_ms: ti.fire_at_ms,
            kind: TimerTaskKind::UserTimer {
                started_event_id: ti.started_event_id,
            },
        })
    }

    /// Earliest timeout owed by any pending activity not yet covered by a
    /// task. Started activities are guarded by start-to-close (and
    /// heartbeat when configured); unstarted ones by schedule-to-start,
    /// with schedule-to-close as the overall bound either way.
    pub fn get_activity_timer_task_if_needed(&self, ms: &mut MutableState) -> Option<TimerTask> {
        let mut best: Option<(i64, i64, i32, i64, TimeoutKind)> = None; // (fire_at, schedule_id, attempt, version, kind)
        for ai in ms.pending_activities() {
            if ai.timer_task_created {
                continue;
            }
            let mut candidate: Option<(i64, TimeoutKind)> = None;
            let mut consider = |fire_at: i64, kind: TimeoutKind| {
                if candidate.map(|(at, _)| fire_at < at).unwrap_or(true) {
                    candidate = Some((fire_at, kind));
                }
            };
            match ai.started_id {
                None => {
                    if ai.schedule_to_start_timeout_seconds > 0 {
                        consider(
                            ai.scheduled_time_ms + ai.schedule_to_start_timeout_seconds as i64 * 1000,
                            TimeoutKind::ScheduleToStart,
                        );
                    }
                }
                Some(_) => {
                    if ai.start_to_close_timeout_seconds > 0 {
                        consider(
                            ai.started_time_ms + ai.start_to_close_timeout_seconds as i64 * 1000,
                            TimeoutKind::StartToClose,
                        );
                    }
                    if ai.heartbeat_timeout_seconds > 0 {
                        let base = if ai.last_heartbeat_ms > 0 {
                            ai.last_heartbeat_ms
                        } else {
                            ai.started_time_ms
                        };
                        consider(
                            base + ai.heartbeat_timeout_seconds as i64 * 1000,
                            TimeoutKind::Heartbeat,
                        );
                    }
                }
            }
            if ai.schedule_to_close_timeout_seconds > 0 {
                consider(
                    ai.scheduled_time_ms + ai.schedule_to_close_timeout_seconds as i64 * 1000,
                    TimeoutKind::ScheduleToClose,
                );
            }
            if let Some((fire_at, kind)) = candidate {
                if best.map(|(at, ..)| fire_at < at).unwrap_or(true) {
                    best = Some((fire_at, ai.schedule_id, ai.attempt, ai.version, kind));
                }
            }
        }
        let (fire_at_ms, schedule_id, attempt, version, timeout_kind) = best?;
        if let Some(ai) = ms
            .pending_activities_mut()
            .find(|ai| ai.schedule_id == schedule_id)
        {
            ai.timer_task_created = true;
        }
        Some(TimerTask {
            version,
            fire_at_ms,
            kind: TimerTaskKind::ActivityTimeout {
                schedule_id,
                attempt,
                timeout_kind,
            },
        })
    }

    /// Retention-scaled deletion task emitted alongside every close.
    pub fn create_delete_history_event_timer_task(&self, retention_days: i32) -> TimerTask {
        TimerTask {
            version: crate::EMPTY_VERSION,
            fire_at_ms: self.now_ms + retention_days.max(0) as i64 * 24 * 3600 * 1000,
            kind: TimerTaskKind::DeleteHistoryEvent,
        }
    }
}
