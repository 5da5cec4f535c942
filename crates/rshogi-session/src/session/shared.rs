//! スレッド間で共有するシーケンサ
//!
//! 指し手 / 待った / パスは同時に 1 つだけ処理する。処理中に重ねて押された待った / パスは
//! 待たせずに捨てる。表示や時計のためにロックを取るだけの呼び出しはこの判定に関わらない。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::{AppliedMove, MatchSession, MoveInput, MoveResult, UndoOutcome};
use crate::clock;
use crate::error::Result;

/// 受け付けたか、処理中のため読み捨てたか
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    Done(T),
    Ignored,
}

impl<T> Guarded<T> {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Guarded::Ignored)
    }
}

/// 処理中フラグを落とす
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<MatchSession>>,
    processing: Arc<AtomicBool>,
}

impl SharedSession {
    pub fn new(session: MatchSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            processing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// ロックを取って `f` を実行する
    pub fn with<R>(&self, f: impl FnOnce(&mut MatchSession) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// 指し手 / 待った / パスと同じ枠で `f` を実行する。
    /// 別の操作が処理中なら `f` を呼ばずに `Ignored` を返す。
    pub fn try_run<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut MatchSession) -> Result<R>,
    ) -> Result<Guarded<R>> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("{what} ignored: another operation is in flight");
            return Ok(Guarded::Ignored);
        }
        let _guard = ProcessingGuard(&self.processing);
        let mut session = self.inner.lock();
        f(&mut *session).map(Guarded::Done)
    }

    /// 指し手。別の操作の処理中なら何もしない。
    pub fn try_apply_move(&self, input: MoveInput) -> Result<Guarded<MoveResult>> {
        self.try_run("move", |session| session.apply_move(input))
    }

    /// 待った。別の操作の処理中なら何もしない。
    pub fn try_undo(&self) -> Result<Guarded<UndoOutcome>> {
        self.try_run("undo", MatchSession::undo)
    }

    /// パス。別の操作の処理中なら何もしない。
    pub fn try_pass(&self) -> Result<Guarded<AppliedMove>> {
        self.try_run("pass", MatchSession::pass)
    }

    /// 時計の確認とワーカー結果の取り込みを `interval` ごとに行うスレッドを起動する
    pub fn spawn_ticker(
        &self,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        clock::spawn_ticker(interval, stop, move || {
            let mut session = inner.lock();
            session.tick();
            session.process_pending();
        })
    }
}
