//! 対局時計
//!
//! 持ち時間 + 秒読みの時計を手番ごとに管理する。残り時間は「最後に精算した時刻」から
//! 読み取り時点で導出し、定期的な減算はしない。ホストが毎フレーム問い合わせなくても、
//! タイマーの取りこぼしがあっても値は正しい。
//!
//! 時間切れは [`ClockManager::tick`] で検出し、コールバックを 1 回だけ呼んで停止する。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::Color;

/// 秒単位で保存されていた旧設定値を見分けるしきい値（この値未満はミリ秒ではなく秒）
pub const LEGACY_SECONDS_THRESHOLD: u64 = 1000;

/// 旧形式（秒）で保存された時間をミリ秒に揃える。
pub fn normalize_legacy_ms(value: u64) -> u64 {
    if value > 0 && value < LEGACY_SECONDS_THRESHOLD {
        value * 1000
    } else {
        value
    }
}

/// 単調増加するミリ秒時刻の供給元
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// 実時間（プロセス起動後の経過ミリ秒）
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }
}

/// 手動で進める時刻（テスト・シミュレーション用）
#[derive(Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 片側の持ち時間
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SideClock {
    pub main_ms: u64,
    pub byoyomi_ms: u64,
}

impl SideClock {
    pub const fn new(main_ms: u64, byoyomi_ms: u64) -> Self {
        Self {
            main_ms,
            byoyomi_ms,
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            main_ms: normalize_legacy_ms(self.main_ms),
            byoyomi_ms: normalize_legacy_ms(self.byoyomi_ms),
        }
    }
}

/// 対局開始時の持ち時間設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockPreset {
    pub sente: SideClock,
    pub gote: SideClock,
}

impl ClockPreset {
    /// 両者同じ持ち時間
    pub const fn symmetric(main_ms: u64, byoyomi_ms: u64) -> Self {
        Self {
            sente: SideClock::new(main_ms, byoyomi_ms),
            gote: SideClock::new(main_ms, byoyomi_ms),
        }
    }

    pub const fn side(&self, side: Color) -> SideClock {
        match side {
            Color::Black => self.sente,
            Color::White => self.gote,
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            sente: self.sente.normalized(),
            gote: self.gote.normalized(),
        }
    }
}

/// 時計の状態。動いている側は高々 1 つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub sente: SideClock,
    pub gote: SideClock,
    pub ticking: Option<Color>,
    pub last_updated_at: u64,
}

impl ClockState {
    fn side(&self, side: Color) -> SideClock {
        match side {
            Color::Black => self.sente,
            Color::White => self.gote,
        }
    }

    fn side_mut(&mut self, side: Color) -> &mut SideClock {
        match side {
            Color::Black => &mut self.sente,
            Color::White => &mut self.gote,
        }
    }
}

/// UI 表示用の残り時間
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSnapshot {
    pub sente_ms: u64,
    pub gote_ms: u64,
    pub ticking: Option<Color>,
}

/// USI `go` コマンドに渡す時間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeArgs {
    pub btime: u64,
    pub wtime: u64,
    pub byoyomi: u64,
}

impl TimeArgs {
    pub fn to_go_command(self) -> String {
        format!(
            "go btime {} wtime {} byoyomi {}",
            self.btime, self.wtime, self.byoyomi
        )
    }
}

pub type TimeExpiredCallback = Box<dyn FnMut(Color) + Send>;

/// 持ち時間 + 秒読みの時計
pub struct ClockManager {
    time: Arc<dyn TimeSource>,
    preset: ClockPreset,
    state: ClockState,
    match_ended: Arc<AtomicBool>,
    on_time_expired: Option<TimeExpiredCallback>,
}

impl ClockManager {
    /// `match_ended` は対局側が持つ「終局済み」フラグ。立っていれば時間切れ通知を出さない。
    pub fn new(time: Arc<dyn TimeSource>, match_ended: Arc<AtomicBool>) -> Self {
        let now = time.now_ms();
        let preset = ClockPreset::default();
        Self {
            time,
            preset,
            state: ClockState {
                sente: preset.sente,
                gote: preset.gote,
                ticking: None,
                last_updated_at: now,
            },
            match_ended,
            on_time_expired: None,
        }
    }

    pub fn set_on_time_expired(&mut self, callback: TimeExpiredCallback) {
        self.on_time_expired = Some(callback);
    }

    /// 持ち時間を設定し直して停止状態にする（対局開始 / 再開始）
    pub fn reset(&mut self, preset: ClockPreset) {
        let preset = preset.normalized();
        self.preset = preset;
        self.state = ClockState {
            sente: preset.sente,
            gote: preset.gote,
            ticking: None,
            last_updated_at: self.time.now_ms(),
        };
    }

    pub fn preset(&self) -> ClockPreset {
        self.preset
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn ticking(&self) -> Option<Color> {
        self.state.ticking
    }

    pub fn start_ticking(&mut self, side: Color) {
        if self.state.ticking.is_some() {
            self.settle(false);
        }
        self.state.ticking = Some(side);
        self.state.last_updated_at = self.time.now_ms();
    }

    /// 停止する。経過分は動いていた側から差し引く（秒読みはその手の残りを保持）。
    pub fn stop_ticking(&mut self) {
        if self.state.ticking.is_some() {
            self.settle(false);
        }
        self.state.ticking = None;
    }

    /// 手番交代。動いていた側を精算して秒読みを戻し、`next_side` の時計を動かす。
    pub fn update_clocks_for_next_turn(&mut self, next_side: Color) {
        if self.state.ticking.is_some() {
            self.settle(true);
        }
        self.state.ticking = Some(next_side);
        self.state.last_updated_at = self.time.now_ms();
    }

    /// 読み取り時点の残り時間（持ち時間 + 秒読み）
    pub fn remaining(&self, side: Color) -> u64 {
        let (main_left, byoyomi_left) = self.derive(side, self.time.now_ms());
        main_left + byoyomi_left
    }

    /// 動いている側が今の手番で使った時間
    pub fn elapsed_in_turn(&self) -> Option<u64> {
        self.state
            .ticking
            .map(|_| self.time.now_ms().saturating_sub(self.state.last_updated_at))
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            sente_ms: self.remaining(Color::Black),
            gote_ms: self.remaining(Color::White),
            ticking: self.state.ticking,
        }
    }

    /// エンジンへ渡す時間。秒読みは `side`（考える側）の設定値。
    pub fn time_args(&self, side: Color) -> TimeArgs {
        let now = self.time.now_ms();
        TimeArgs {
            btime: self.derive(Color::Black, now).0,
            wtime: self.derive(Color::White, now).0,
            byoyomi: self.preset.side(side).byoyomi_ms,
        }
    }

    /// 時間切れを確認する。切れていれば停止し、終局済みでなければコールバックを呼ぶ。
    pub fn tick(&mut self) -> Option<Color> {
        let side = self.state.ticking?;
        if self.remaining(side) > 0 {
            return None;
        }
        *self.state.side_mut(side) = SideClock::new(0, 0);
        self.state.ticking = None;
        self.state.last_updated_at = self.time.now_ms();
        if self.match_ended.load(Ordering::SeqCst) {
            log::debug!("clock: {} flagged after match end, notification suppressed", side.label());
            return None;
        }
        log::info!("clock: time expired for {}", side.label());
        if let Some(cb) = self.on_time_expired.as_mut() {
            cb(side);
        }
        Some(side)
    }

    fn derive(&self, side: Color, now: u64) -> (u64, u64) {
        let clock = self.state.side(side);
        let is_ticking = self.state.ticking == Some(side);
        let elapsed = if is_ticking {
            now.saturating_sub(self.state.last_updated_at)
        } else {
            0
        };
        let main_left = clock.main_ms.saturating_sub(elapsed);
        let over_main = elapsed.saturating_sub(clock.main_ms);
        let byoyomi_left = if clock.main_ms == 0 && is_ticking {
            clock.byoyomi_ms.saturating_sub(elapsed)
        } else {
            clock.byoyomi_ms.saturating_sub(over_main)
        };
        (main_left, byoyomi_left)
    }

    fn settle(&mut self, move_completed: bool) {
        let Some(side) = self.state.ticking else {
            return;
        };
        let now = self.time.now_ms();
        let (main_left, byoyomi_left) = self.derive(side, now);
        let byoyomi = if move_completed {
            self.preset.side(side).byoyomi_ms
        } else {
            byoyomi_left
        };
        *self.state.side_mut(side) = SideClock::new(main_left, byoyomi);
        self.state.last_updated_at = now;
    }
}

/// `interval` ごとに `f` を呼ぶスレッドを起動する。`stop` が立つと終了する。
pub fn spawn_ticker<F>(
    interval: Duration,
    stop: Arc<AtomicBool>,
    mut f: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    thread::Builder::new()
        .name("clock-ticker".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                f();
            }
        })
}
