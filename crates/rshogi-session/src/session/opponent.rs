//! 対局相手のエンジン
//!
//! 手番が来るたびにバックグラウンドで 1 回探索し、最善手をチャネルで返す。
//! 依頼ごとにチケットを発行し、シーケンサは最新のチケットと一致する結果だけを適用する。

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::engine::{CancelToken, EngineClient, EngineFactory, SearchRequest};
use crate::kifu::NodeId;
use crate::types::{Color, EvalEvent};

/// 探索依頼の識別子。依頼時点の局面（世代・ノード・手番）を控える。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTicket {
    pub generation: u64,
    pub node_id: NodeId,
    pub side: Color,
    pub request_id: u64,
}

/// エンジンから届いた結果
#[derive(Debug, Clone)]
pub struct EngineReply {
    pub ticket: EngineTicket,
    /// 最善手（`resign` / `win` を含む）。時間内に返らなければ `None`。
    pub result: Result<Option<String>, String>,
    pub last_eval: Option<EvalEvent>,
}

pub(crate) struct LiveOpponent {
    factory: Arc<dyn EngineFactory>,
    engine: Arc<Mutex<Option<Box<dyn EngineClient>>>>,
    pending: Option<(EngineTicket, CancelToken)>,
    next_request_id: u64,
    tx: Sender<EngineReply>,
    rx: Receiver<EngineReply>,
}

impl LiveOpponent {
    pub(crate) fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            factory,
            engine: Arc::new(Mutex::new(None)),
            pending: None,
            next_request_id: 1,
            tx,
            rx,
        }
    }

    pub(crate) fn next_ticket(&mut self, generation: u64, node_id: NodeId, side: Color) -> EngineTicket {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        EngineTicket {
            generation,
            node_id,
            side,
            request_id,
        }
    }

    /// 探索を依頼する。前の依頼は中断する。
    pub(crate) fn request(&mut self, ticket: EngineTicket, request: SearchRequest) {
        self.cancel();
        let cancel = CancelToken::new();
        self.pending = Some((ticket, cancel.clone()));

        let engine = Arc::clone(&self.engine);
        let factory = Arc::clone(&self.factory);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("engine-opponent".into())
            .spawn(move || {
                let mut slot = engine.lock();
                if slot.is_none() {
                    match factory.create(0) {
                        Ok(client) => *slot = Some(client),
                        Err(e) => {
                            let _ = tx.send(EngineReply {
                                ticket,
                                result: Err(format!("{e:#}")),
                                last_eval: None,
                            });
                            return;
                        }
                    }
                }
                let Some(client) = slot.as_mut() else {
                    return;
                };
                let reply = match client.search(&request, &cancel, &mut |_: &EvalEvent| {}) {
                    Ok(outcome) => EngineReply {
                        ticket,
                        result: Ok(outcome.bestmove),
                        last_eval: outcome.last_eval,
                    },
                    Err(e) => {
                        // 次の依頼で作り直す
                        *slot = None;
                        EngineReply {
                            ticket,
                            result: Err(format!("{e:#}")),
                            last_eval: None,
                        }
                    }
                };
                drop(slot);
                let _ = tx.send(reply);
            });
        if let Err(e) = spawned {
            log::error!("failed to start engine search: {e}");
            let _ = self.tx.send(EngineReply {
                ticket,
                result: Err(e.to_string()),
                last_eval: None,
            });
        }
    }

    /// 進行中の依頼を中断し、以後その結果は古いものとして扱う
    pub(crate) fn cancel(&mut self) {
        if let Some((ticket, token)) = self.pending.take() {
            log::debug!("engine request {} cancelled", ticket.request_id);
            token.cancel();
        }
    }

    pub(crate) fn pending(&self) -> Option<EngineTicket> {
        self.pending.as_ref().map(|(ticket, _)| *ticket)
    }

    /// 結果を受け取った依頼を完了にする
    pub(crate) fn settle(&mut self, ticket: &EngineTicket) {
        if self.pending() == Some(*ticket) {
            self.pending = None;
        }
    }

    pub(crate) fn try_recv(&self) -> Option<EngineReply> {
        self.rx.try_recv().ok()
    }

    /// 結果が届くまで待つ（ホストがフレームループを持たない場合・テスト用）
    pub(crate) fn recv_timeout(&self, timeout: std::time::Duration) -> Option<EngineReply> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for LiveOpponent {
    fn drop(&mut self) {
        self.cancel();
    }
}
