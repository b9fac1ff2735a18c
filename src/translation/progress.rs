//! 会话进度跟踪
//!
//! 跟踪器独占会话记录，所有计数器只增不减。进度事件按会话节流，
//! 两次之间至少间隔 200ms；完成与出错事件不受节流限制。

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::translation::config::constants;
use crate::translation::error::TranslationResult;
use crate::translation::events::{Event, EventBus, EventType};
use crate::translation::storage::{Session, SessionMeta, SessionStatus, SessionStore};

/// 出错会话的进度上限
const ERROR_PERCENT_CAP: f64 = 99.0;

/// 预计剩余时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Calculating,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Calculating => f.write_str("calculating"),
            Eta::Remaining(d) => {
                let secs = d.as_secs();
                let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
                if h > 0 {
                    write!(f, "{}h{}m{}s", h, m, s)
                } else if m > 0 {
                    write!(f, "{}m{}s", m, s)
                } else {
                    write!(f, "{}s", s)
                }
            }
        }
    }
}

/// 线性外推：已完成比例不少于 5% 且已用时不少于 2 秒时才给出估计
pub fn compute_eta(completed: u64, total: u64, elapsed: Duration) -> Eta {
    if total == 0 || completed == 0 || elapsed < Duration::from_secs(2) {
        return Eta::Calculating;
    }
    if (completed as f64 / total as f64) < 0.05 {
        return Eta::Calculating;
    }
    let rate = completed as f64 / elapsed.as_secs_f64();
    let remaining = total.saturating_sub(completed) as f64 / rate;
    Eta::Remaining(Duration::from_secs_f64(remaining))
}

/// 章节进度百分比
///
/// 基数为 `(当前章 - 1) / 总章数`，再加上章内 `当前节 / 总节数` 的份额，结果限制在 [0, 100]。
pub fn compute_percent(
    current_chapter: usize,
    total_chapters: usize,
    current_section: usize,
    total_sections: usize,
) -> f64 {
    if total_chapters == 0 {
        return 0.0;
    }
    let chapters = total_chapters as f64;
    let mut fraction = (current_chapter as f64 - 1.0) / chapters;
    if total_sections > 0 {
        fraction += (current_section as f64 / total_sections as f64) / chapters;
    }
    (fraction * 100.0).clamp(0.0, 100.0)
}

struct TrackerState {
    session: Session,
    started: Instant,
    last_emit: Option<Instant>,
}

/// 会话进度跟踪器
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    events: EventBus,
    throttle: Duration,
}

impl ProgressTracker {
    /// 以新会话启动
    pub fn start(meta: &SessionMeta, events: EventBus) -> Self {
        let tracker = Self::with_session(Session::new(meta), events);
        let snapshot = tracker.snapshot();
        tracing::info!(
            session_id = %snapshot.session_id,
            book = %snapshot.book_title,
            "翻译会话开始"
        );
        tracker.events.publish(
            Event::new(EventType::SessionStarted, format!("开始翻译《{}》", snapshot.book_title))
                .with_session(Some(&snapshot.session_id))
                .with_data("source_lang", snapshot.source_lang.as_str())
                .with_data("target_lang", snapshot.target_lang.as_str())
                .with_data("provider", snapshot.provider.as_str())
                .with_data("total_chapters", snapshot.total_chapters as u64),
        );
        tracker
    }

    /// 从已存储的会话恢复，计数器沿用存储值
    pub fn resume(mut session: Session, events: EventBus) -> Self {
        session.status = SessionStatus::Translating;
        session.current_task = "Resuming translation".to_string();
        session.error_message = None;
        session.end_time = None;
        session.updated_at = Utc::now();
        tracing::info!(
            session_id = %session.session_id,
            completed = session.items_completed,
            "恢复翻译会话"
        );
        let tracker = Self::with_session(session, events);
        let snapshot = tracker.snapshot();
        tracker.events.publish(
            Event::new(EventType::SessionStarted, "恢复翻译会话")
                .with_session(Some(&snapshot.session_id))
                .with_data("resumed", true)
                .with_data("items_completed", snapshot.items_completed),
        );
        tracker
    }

    fn with_session(session: Session, events: EventBus) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                session,
                started: Instant::now(),
                last_emit: None,
            }),
            events,
            throttle: constants::PROGRESS_THROTTLE,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 修改会话并按节流规则发布进度事件
    fn mutate<F>(&self, force: bool, f: F)
    where
        F: FnOnce(&mut Session),
    {
        let event = {
            let mut state = self.lock();
            let prev_completed = state.session.items_completed;
            f(&mut state.session);
            let s = &mut state.session;
            if s.items_total > 0 {
                // 恢复会话时，先前失败的单元重试成功后仍计在失败数中，完成数以剩余单元为上限
                let cap = s.items_total.saturating_sub(s.items_failed);
                s.items_completed = s.items_completed.min(cap).max(prev_completed);
            }
            s.items_total = s.items_total.max(s.items_completed + s.items_failed);
            if s.status != SessionStatus::Completed {
                s.percent = compute_percent(
                    s.current_chapter,
                    s.total_chapters,
                    s.current_section,
                    s.total_sections,
                );
                if s.status == SessionStatus::Error {
                    s.percent = s.percent.min(ERROR_PERCENT_CAP);
                }
            }
            s.updated_at = Utc::now();

            let due = state
                .last_emit
                .map_or(true, |last| last.elapsed() >= self.throttle);
            if force || due {
                state.last_emit = Some(Instant::now());
                Some(progress_event(&state.session, state.started.elapsed()))
            } else {
                None
            }
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    pub fn session_id(&self) -> String {
        self.lock().session.session_id.clone()
    }

    pub fn update_chapter(&self, chapter: usize, title: &str, total_sections: usize) {
        self.mutate(false, |s| {
            s.current_chapter = chapter;
            s.chapter_title = title.to_string();
            s.total_sections = total_sections;
            s.current_section = 0;
            s.current_task = format!("Translating chapter {}/{}", chapter, s.total_chapters);
        });
    }

    pub fn update_section(&self, section: usize) {
        self.mutate(false, |s| s.current_section = section);
    }

    pub fn increment_completed(&self) {
        self.mutate(false, |s| s.items_completed += 1);
    }

    pub fn increment_failed(&self) {
        self.mutate(false, |s| s.items_failed += 1);
    }

    /// 恢复会话时把已完成数推进到 `n`，不会回退
    pub fn advance_completed_to(&self, n: u64) {
        self.mutate(false, |s| s.items_completed = s.items_completed.max(n));
    }

    pub fn advance_failed_to(&self, n: u64) {
        self.mutate(false, |s| s.items_failed = s.items_failed.max(n));
    }

    pub fn set_total(&self, total: u64) {
        self.mutate(false, |s| s.items_total = total);
    }

    pub fn set_status(&self, status: SessionStatus, task: &str) {
        self.mutate(true, |s| {
            s.status = status;
            s.current_task = task.to_string();
        });
    }

    pub fn complete(&self) {
        self.mutate(true, |s| {
            s.status = SessionStatus::Completed;
            s.percent = 100.0;
            s.current_chapter = s.total_chapters;
            s.current_task = "Translation completed".to_string();
            s.end_time = Some(Utc::now());
        });

        let snapshot = self.snapshot();
        tracing::info!(
            session_id = %snapshot.session_id,
            completed = snapshot.items_completed,
            failed = snapshot.items_failed,
            "翻译会话完成"
        );
        self.events.publish(
            Event::new(EventType::SessionCompleted, "翻译完成")
                .with_session(Some(&snapshot.session_id))
                .with_data("items_completed", snapshot.items_completed)
                .with_data("items_failed", snapshot.items_failed)
                .with_data("items_total", snapshot.items_total)
                .with_data("duration_secs", snapshot.duration_secs().unwrap_or_default()),
        );
    }

    pub fn error(&self, message: &str) {
        self.mutate(true, |s| {
            s.status = SessionStatus::Error;
            s.error_message = Some(message.to_string());
            s.current_task = "Translation failed".to_string();
            s.end_time = Some(Utc::now());
        });

        let snapshot = self.snapshot();
        tracing::error!(session_id = %snapshot.session_id, "翻译会话出错: {}", message);
        self.events.publish(
            Event::new(EventType::SessionError, message)
                .with_session(Some(&snapshot.session_id))
                .with_data("percent", snapshot.percent)
                .with_data("items_completed", snapshot.items_completed)
                .with_data("items_failed", snapshot.items_failed),
        );
    }

    /// 会话记录的副本
    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn eta(&self) -> Eta {
        let state = self.lock();
        compute_eta(
            state.session.items_completed,
            state.session.items_total,
            state.started.elapsed(),
        )
    }

    /// 写入存储
    pub async fn persist(&self, store: &dyn SessionStore) -> TranslationResult<()> {
        store.update_session(&self.snapshot()).await
    }
}

fn progress_event(session: &Session, elapsed: Duration) -> Event {
    let eta = compute_eta(session.items_completed, session.items_total, elapsed);
    Event::new(
        EventType::Progress,
        format!("{:.1}% {}", session.percent, session.current_task),
    )
    .with_session(Some(&session.session_id))
    .with_data("status", session.status.as_str())
    .with_data("percent", session.percent)
    .with_data("current_chapter", session.current_chapter as u64)
    .with_data("total_chapters", session.total_chapters as u64)
    .with_data("current_section", session.current_section as u64)
    .with_data("total_sections", session.total_sections as u64)
    .with_data("items_completed", session.items_completed)
    .with_data("items_failed", session.items_failed)
    .with_data("items_total", session.items_total)
    .with_data("eta", eta.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chapters: usize) -> SessionMeta {
        SessionMeta {
            book_title: "Book".into(),
            source_lang: "ru".into(),
            target_lang: "sr".into(),
            provider: "dictionary".into(),
            total_chapters: chapters,
            ..SessionMeta::default()
        }
    }

    #[test]
    fn test_percent_formula() {
        assert_eq!(compute_percent(1, 4, 0, 0), 0.0);
        assert_eq!(compute_percent(2, 4, 0, 0), 25.0);
        assert_eq!(compute_percent(2, 4, 2, 4), 37.5);
        assert_eq!(compute_percent(0, 4, 0, 0), 0.0);
        assert_eq!(compute_percent(9, 4, 0, 0), 100.0);
        assert_eq!(compute_percent(1, 0, 0, 0), 0.0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(compute_eta(10, 100, Duration::from_secs(1)), Eta::Calculating);
        assert_eq!(compute_eta(1, 100, Duration::from_secs(10)), Eta::Calculating);
        assert_eq!(
            compute_eta(10, 100, Duration::from_secs(10)),
            Eta::Remaining(Duration::from_secs(90))
        );
        assert_eq!(Eta::Remaining(Duration::from_secs(90)).to_string(), "1m30s");
        assert_eq!(Eta::Remaining(Duration::from_secs(3725)).to_string(), "1h2m5s");
        assert_eq!(Eta::Calculating.to_string(), "calculating");
    }

    #[test]
    fn test_counters_and_completion() {
        let tracker = ProgressTracker::start(&meta(2), EventBus::new());
        tracker.set_total(3);
        tracker.update_chapter(1, "One", 2);
        tracker.increment_completed();
        tracker.update_section(1);
        tracker.increment_failed();
        let snap = tracker.snapshot();
        assert_eq!(snap.items_completed, 1);
        assert_eq!(snap.items_failed, 1);
        assert_eq!(snap.percent, 25.0);

        tracker.complete();
        let snap = tracker.snapshot();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert_eq!(snap.percent, 100.0);
        assert!(snap.end_time.is_some());
    }

    #[test]
    fn test_total_never_below_processed() {
        let tracker = ProgressTracker::start(&meta(1), EventBus::new());
        tracker.increment_completed();
        tracker.increment_completed();
        tracker.set_total(1);
        let snap = tracker.snapshot();
        assert!(snap.items_completed + snap.items_failed <= snap.items_total);

        tracker.advance_completed_to(1);
        assert_eq!(tracker.snapshot().items_completed, 2);
    }

    #[test]
    fn test_resumed_counters_stay_within_unit_count() {
        let mut stored = Session::new(&meta(1));
        stored.items_total = 10;
        stored.items_completed = 4;
        stored.items_failed = 1;

        let tracker = ProgressTracker::resume(stored, EventBus::new());
        tracker.set_total(10);
        tracker.advance_completed_to(2);
        assert_eq!(tracker.snapshot().items_completed, 4);

        // 重试成功的失败单元不会把总数撑大
        tracker.advance_completed_to(10);
        tracker.complete();
        let snap = tracker.snapshot();
        assert_eq!(snap.items_total, 10);
        assert_eq!(snap.items_failed, 1);
        assert_eq!(snap.items_completed, 9);
    }

    #[test]
    fn test_error_keeps_percent_below_100() {
        let tracker = ProgressTracker::start(&meta(1), EventBus::new());
        tracker.update_chapter(1, "Only", 1);
        tracker.update_section(1);
        assert_eq!(tracker.snapshot().percent, 100.0);
        tracker.error("cancelled");
        let snap = tracker.snapshot();
        assert_eq!(snap.status, SessionStatus::Error);
        assert!(snap.percent < 100.0);
        assert_eq!(snap.error_message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_progress_events_are_throttled() {
        let events = EventBus::new();
        let progress = events.subscribe(EventType::Progress);
        let tracker = ProgressTracker::start(&meta(1), events).with_throttle(Duration::from_secs(60));
        for _ in 0..50 {
            tracker.increment_completed();
        }
        assert_eq!(progress.drain().len(), 1);

        tracker.complete();
        assert_eq!(progress.drain().len(), 1);
    }

    #[test]
    fn test_resume_clears_error_state() {
        let tracker = ProgressTracker::start(&meta(1), EventBus::new());
        tracker.increment_completed();
        tracker.error("boom");
        let stored = tracker.snapshot();

        let resumed = ProgressTracker::resume(stored.clone(), EventBus::new());
        let snap = resumed.snapshot();
        assert_eq!(snap.session_id, stored.session_id);
        assert_eq!(snap.status, SessionStatus::Translating);
        assert_eq!(snap.items_completed, 1);
        assert!(snap.error_message.is_none());
        assert!(snap.end_time.is_none());
    }
}
