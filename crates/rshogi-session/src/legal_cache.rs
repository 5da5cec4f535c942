//! 合法手キャッシュ
//!
//! 現在の手順の 1 手数分だけ合法手集合を保持する。ツリーが変わったら（指し手適用・
//! 分岐切替・待った・編集）呼び出し側が [`LegalMoveCache::clear`] で丸ごと捨てる。
//! 分岐ごとにパス権や王手の状況が違うので、部分的な無効化はしない。
//!
//! 解決処理（resolver）は呼び出し側が渡す。キャッシュはメモ化と、同じ手数に対する
//! 同時リクエストの合流だけを行う。2 本目のリクエストは 1 本目の完了を待つ。

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::SessionError;

pub type LegalMoveSet = Arc<HashSet<String>>;

#[derive(Default)]
struct CacheState {
    /// clear のたびに進む。古い解決結果を捨てるのに使う。
    generation: u64,
    entry: Option<(u32, LegalMoveSet)>,
    in_flight: Option<u32>,
}

#[derive(Default)]
pub struct LegalMoveCache {
    state: Mutex<CacheState>,
    resolved: Condvar,
}

impl LegalMoveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ply` の合法手集合を返す。キャッシュになければ `resolver` で求める。
    ///
    /// 同じ `ply` の解決が進行中なら、その完了を待って結果を共有する。
    /// 解決に失敗した場合はエラーをそのまま返し、何もキャッシュしない。
    pub fn get_or_resolve<F>(&self, ply: u32, resolver: F) -> Result<LegalMoveSet, SessionError>
    where
        F: FnOnce() -> Result<HashSet<String>, String>,
    {
        let mut state = self.state.lock();
        loop {
            if let Some((cached_ply, set)) = &state.entry {
                if *cached_ply == ply {
                    return Ok(Arc::clone(set));
                }
            }
            if state.in_flight == Some(ply) {
                self.resolved.wait(&mut state);
                continue;
            }
            break;
        }

        let generation = state.generation;
        let owns_flight = state.in_flight.is_none();
        if owns_flight {
            state.in_flight = Some(ply);
        }
        drop(state);

        let outcome = resolver();

        let mut state = self.state.lock();
        if owns_flight && state.generation == generation && state.in_flight == Some(ply) {
            state.in_flight = None;
        }
        let result = match outcome {
            Ok(set) => {
                let set = Arc::new(set);
                if state.generation == generation {
                    state.entry = Some((ply, Arc::clone(&set)));
                } else {
                    log::debug!("legal move cache: discarding result for ply {ply} resolved before clear");
                }
                Ok(set)
            }
            Err(message) => Err(SessionError::Resolution(message)),
        };
        drop(state);
        self.resolved.notify_all();
        result
    }

    pub fn is_cached(&self, ply: u32) -> bool {
        matches!(&self.state.lock().entry, Some((cached, _)) if *cached == ply)
    }

    /// キャッシュを全消去する。進行中の解決結果は保存されなくなる。
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.entry = None;
        state.in_flight = None;
        drop(state);
        self.resolved.notify_all();
    }
}
