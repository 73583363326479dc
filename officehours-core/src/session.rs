// ABOUTME: Helper session lifecycle: who is helping, who they claimed, and presence correlation.
// ABOUTME: Turns claims plus meeting-space join/leave signals into help-session entries and active time.

use crate::error::QueueError;
use crate::ids::{MemberId, QueueId};
use crate::queue::Waiter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// An actor actively helping, or a closed record of a past session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSession {
    pub actor_id: MemberId,
    pub help_start: DateTime<Utc>,
    pub help_end: Option<DateTime<Utc>>,
    pub served_queues: Vec<QueueId>,
    pub helped_waiters: Vec<Waiter>,
    /// Milliseconds during which at least one claimed student was present
    pub active_time_ms: i64,
}

impl HelperSession {
    pub fn is_open(&self) -> bool {
        self.help_end.is_none()
    }

    pub fn serves(&self, queue: &QueueId) -> bool {
        self.served_queues.contains(queue)
    }

    /// Wall-clock length of a closed session
    pub fn duration_ms(&self) -> Option<i64> {
        self.help_end
            .map(|end| (end - self.help_start).num_milliseconds().max(0))
    }
}

/// A waiter that was dequeued but has not yet shown up in the meeting space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JustClaimed {
    pub actor_id: MemberId,
    pub queue_id: QueueId,
    pub wait_start: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
    pub helper_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpSessionEntry {
    pub student_id: MemberId,
    pub helper_id: MemberId,
    pub queue_id: QueueId,
    pub session_start: DateTime<Utc>,
    pub session_end: Option<DateTime<Utc>>,
    pub wait_start: DateTime<Utc>,
    /// Time from joining the queue until being claimed
    pub wait_time_ms: i64,
}

impl HelpSessionEntry {
    pub fn is_complete(&self) -> bool {
        self.session_end.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.session_end
            .map(|end| (end - self.session_start).num_milliseconds().max(0))
    }
}

#[derive(Debug)]
struct OpenSession {
    session: HelperSession,
    present_students: BTreeSet<MemberId>,
    active_since: Option<DateTime<Utc>>,
}

impl OpenSession {
    fn student_arrived(&mut self, student: MemberId, when: DateTime<Utc>) {
        if self.present_students.is_empty() {
            self.active_since = Some(when);
        }
        self.present_students.insert(student);
    }

    fn student_left(&mut self, student: &MemberId, when: DateTime<Utc>) {
        if !self.present_students.remove(student) {
            return;
        }
        if self.present_students.is_empty() {
            self.accrue(when);
        }
    }

    fn accrue(&mut self, until: DateTime<Utc>) {
        if let Some(since) = self.active_since.take() {
            let elapsed = (until - since).num_milliseconds().max(0);
            self.session.active_time_ms += elapsed;
        }
    }
}

/// Owns every open helper session and the claim/presence correlation records
#[derive(Debug, Default)]
pub struct SessionManager {
    open: HashMap<MemberId, OpenSession>,
    just_claimed: HashMap<MemberId, JustClaimed>,
    in_progress: HashMap<MemberId, HelpSessionEntry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_helping(&self, actor: &MemberId) -> bool {
        self.open.contains_key(actor)
    }

    pub fn session(&self, actor: &MemberId) -> Option<HelperSession> {
        self.open.get(actor).map(|s| s.session.clone())
    }

    /// Open sessions, oldest first
    pub fn open_sessions(&self) -> Vec<HelperSession> {
        let mut sessions: Vec<HelperSession> =
            self.open.values().map(|s| s.session.clone()).collect();
        sessions.sort_by(|a, b| {
            a.help_start
                .cmp(&b.help_start)
                .then_with(|| a.actor_id.cmp(&b.actor_id))
        });
        sessions
    }

    /// Whether any open session lists this queue as served
    pub fn is_queue_served(&self, queue: &QueueId) -> bool {
        self.open.values().any(|s| s.session.serves(queue))
    }

    pub fn just_claimed(&self, student: &MemberId) -> Option<&JustClaimed> {
        self.just_claimed.get(student)
    }

    pub fn in_progress(&self, student: &MemberId) -> Option<&HelpSessionEntry> {
        self.in_progress.get(student)
    }

    pub fn start_helping(
        &mut self,
        actor: MemberId,
        served_queues: Vec<QueueId>,
        now: DateTime<Utc>,
    ) -> Result<HelperSession, QueueError> {
        if self.open.contains_key(&actor) {
            return Err(QueueError::AlreadyHelping { member: actor });
        }
        let session = HelperSession {
            actor_id: actor.clone(),
            help_start: now,
            help_end: None,
            served_queues,
            helped_waiters: Vec::new(),
            active_time_ms: 0,
        };
        self.open.insert(
            actor,
            OpenSession {
                session: session.clone(),
                present_students: BTreeSet::new(),
                active_since: None,
            },
        );
        Ok(session)
    }

    /// Fails unless `helper` has an open session
    pub fn ensure_helping(&self, helper: &MemberId) -> Result<(), QueueError> {
        if self.open.contains_key(helper) {
            Ok(())
        } else {
            Err(QueueError::NotHelping {
                member: helper.clone(),
            })
        }
    }

    /// Attach a freshly dequeued waiter to the helper's session
    pub fn record_claim(
        &mut self,
        helper: &MemberId,
        waiter: Waiter,
        now: DateTime<Utc>,
    ) -> Result<JustClaimed, QueueError> {
        let open = self
            .open
            .get_mut(helper)
            .ok_or_else(|| QueueError::NotHelping {
                member: helper.clone(),
            })?;
        open.session.helped_waiters.push(waiter.clone());

        // A new claim means any open entry for this student missed its leave signal
        if let Some(stale) = self.in_progress.remove(&waiter.actor_id) {
            if let Some(previous) = self.open.get_mut(&stale.helper_id) {
                previous.student_left(&stale.student_id, now);
            }
            tracing::debug!(
                student = %stale.student_id,
                previous_helper = %stale.helper_id,
                helper = %helper,
                "Dropping help session entry that never saw a presence leave"
            );
        }

        let record = JustClaimed {
            actor_id: waiter.actor_id.clone(),
            queue_id: waiter.queue_id,
            wait_start: waiter.wait_start,
            claimed_at: now,
            helper_id: helper.clone(),
        };
        if let Some(previous) = self
            .just_claimed
            .insert(waiter.actor_id.clone(), record.clone())
        {
            tracing::debug!(
                student = %previous.actor_id,
                previous_helper = %previous.helper_id,
                helper = %helper,
                "Superseding unconfirmed claim"
            );
        }
        Ok(record)
    }

    /// Promote a pending claim once the student shows up in the meeting space.
    ///
    /// Unknown actors and duplicate joins are ignored. A claim whose helper has
    /// stopped resolves against the longest-running open session; with no open
    /// session left the claim is stale and discarded.
    pub fn confirm_presence_join(
        &mut self,
        actor: &MemberId,
        when: DateTime<Utc>,
    ) -> Option<HelpSessionEntry> {
        if self.in_progress.contains_key(actor) {
            tracing::debug!(actor = %actor, "Ignoring duplicate presence join");
            return None;
        }
        let claim = self.just_claimed.remove(actor)?;

        let helper_id = if self.open.contains_key(&claim.helper_id) {
            claim.helper_id.clone()
        } else {
            match self.open_sessions().into_iter().next() {
                Some(session) => session.actor_id,
                None => {
                    tracing::debug!(
                        student = %claim.actor_id,
                        helper = %claim.helper_id,
                        "Discarding stale claim, no open helper session"
                    );
                    return None;
                }
            }
        };

        let entry = HelpSessionEntry {
            student_id: claim.actor_id.clone(),
            helper_id: helper_id.clone(),
            queue_id: claim.queue_id,
            session_start: when,
            session_end: None,
            wait_start: claim.wait_start,
            wait_time_ms: (claim.claimed_at - claim.wait_start)
                .num_milliseconds()
                .max(0),
        };
        if let Some(open) = self.open.get_mut(&helper_id) {
            open.student_arrived(claim.actor_id.clone(), when);
        }
        self.in_progress.insert(claim.actor_id, entry.clone());
        Some(entry)
    }

    /// Close the in-progress entry for a student leaving the meeting space
    pub fn confirm_presence_leave(
        &mut self,
        actor: &MemberId,
        when: DateTime<Utc>,
    ) -> Option<HelpSessionEntry> {
        let mut entry = self.in_progress.remove(actor)?;
        let end = when.max(entry.session_start);
        entry.session_end = Some(end);
        if let Some(open) = self.open.get_mut(&entry.helper_id) {
            open.student_left(actor, end);
        }
        Some(entry)
    }

    /// Close the helper's session permanently.
    ///
    /// Unconfirmed claims stay pending; they may still resolve against another
    /// open session.
    pub fn stop_helping(
        &mut self,
        actor: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<HelperSession, QueueError> {
        let mut open = self
            .open
            .remove(actor)
            .ok_or_else(|| QueueError::NotHelping {
                member: actor.clone(),
            })?;
        open.accrue(now);
        open.session.help_end = Some(now);

        let pending = self
            .just_claimed
            .values()
            .filter(|c| &c.helper_id == actor)
            .count();
        if pending > 0 {
            tracing::debug!(helper = %actor, pending, "Helper stopped with unconfirmed claims");
        }
        Ok(open.session)
    }

    /// Drop every unconfirmed claim made by a helper who is no longer helping
    pub fn discard_stale_claims(&mut self) -> Vec<JustClaimed> {
        let open = &self.open;
        let stale: Vec<MemberId> = self
            .just_claimed
            .values()
            .filter(|c| !open.contains_key(&c.helper_id))
            .map(|c| c.actor_id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| self.just_claimed.remove(id))
            .collect()
    }
}
