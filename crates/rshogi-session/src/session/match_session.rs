use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::opponent::{EngineReply, LiveOpponent};
use super::{
    AppliedMove, EndReason, GameOutcome, Mode, MoveInput, MoveResult, Promotion, SessionEvent,
    UndoOutcome,
};
use crate::analysis::{self, AnalysisEvent, AnalysisJob, EnginePool};
use crate::clock::{ClockManager, ClockSnapshot, TimeSource};
use crate::config::{Controller, SessionConfig};
use crate::engine::{EngineFactory, SearchLimit, SearchRequest};
use crate::error::{PoolError, Result, SessionError};
use crate::kifu::{KifuTree, NodeId, NodeMeta};
use crate::legal_cache::{LegalMoveCache, LegalMoveSet};
use crate::position::{LegalQueryOptions, Position, PositionService};
use crate::record::{
    ImportedMove, ImportedRecord, MoveToken, RecordMeta, RecordMoveEntry, Square, write_jsonl,
};
use crate::types::{Color, EvalEvent, NodeEval, PassRights, Score};

/// 保存するモード（どれでもなければ検討モード）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveMode {
    Editing,
    Playing,
    Paused,
}

#[derive(Debug, Clone)]
struct EditState {
    position: Position,
    /// 確定していない変更がある
    dirty: bool,
    /// 中断中から入った（確定しなければ対局を再開できる）
    from_pause: bool,
}

/// 盤面の合法手集合から成りの扱いを判定する。どちらの形も合法でなければ `None`。
pub fn classify_promotion(legal: &HashSet<String>, from: Square, to: Square) -> Option<Promotion> {
    let plain = format!("{from}{to}");
    let promoted = format!("{plain}+");
    match (legal.contains(&plain), legal.contains(&promoted)) {
        (true, true) => Some(Promotion::Optional),
        (false, true) => Some(Promotion::Forced),
        (true, false) => Some(Promotion::None),
        (false, false) => None,
    }
}

fn resolve_start(service: &dyn PositionService, start: &str) -> Result<Position> {
    if start == "startpos" {
        service.initial_board().map_err(SessionError::Conversion)
    } else {
        service.parse_sfen(start).map_err(SessionError::Conversion)
    }
}

fn imported_eval(mv: &ImportedMove) -> Option<EvalEvent> {
    let score = match (mv.eval_mate, mv.eval_cp) {
        (Some(mate), _) => Score::Mate(mate),
        (None, Some(cp)) => Score::Cp(cp),
        (None, None) => return None,
    };
    Some(EvalEvent {
        score: Some(score),
        depth: mv.depth,
        ..EvalEvent::default()
    })
}

/// 対局シーケンサ
///
/// 棋譜ツリー・時計・パス権を所有する唯一の書き手。局面のルールは [`PositionService`]、
/// 思考は [`EngineFactory`] から作るエンジンに任せる。
pub struct MatchSession {
    config: SessionConfig,
    service: Arc<dyn PositionService>,
    tree: KifuTree,
    clock: ClockManager,
    cache: LegalMoveCache,
    active: Option<ActiveMode>,
    edit: Option<EditState>,
    /// 対局開始時のパス権（パスルール無効なら `None`）
    pass_rights: Option<PassRights>,
    match_ended: Arc<AtomicBool>,
    outcome: Option<(GameOutcome, EndReason)>,
    selection: Option<Square>,
    events: Vec<SessionEvent>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    opponent: Option<LiveOpponent>,
    pool: Option<EnginePool>,
    analysis_tx: Sender<AnalysisEvent>,
    analysis_rx: Receiver<AnalysisEvent>,
}

impl MatchSession {
    /// 設定の開始局面で検討モードのセッションを作る
    pub fn new(
        config: SessionConfig,
        service: Arc<dyn PositionService>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let position = resolve_start(service.as_ref(), &config.start)?;
        let match_ended = Arc::new(AtomicBool::new(false));
        let mut clock = ClockManager::new(time, Arc::clone(&match_ended));
        clock.reset(config.clock);
        let (analysis_tx, analysis_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            tree: KifuTree::new(position, config.start.clone()),
            pass_rights: config.pass.initial_rights(),
            config,
            service,
            clock,
            cache: LegalMoveCache::new(),
            active: None,
            edit: None,
            match_ended,
            outcome: None,
            selection: None,
            events: Vec::new(),
            engine_factory: None,
            opponent: None,
            pool: None,
            analysis_tx,
            analysis_rx,
        })
    }

    /// 対局相手・解析に使うエンジンを設定する
    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.opponent = Some(LiveOpponent::new(Arc::clone(&factory)));
        self.engine_factory = Some(factory);
        self
    }

    // ------------------------------------------------------------------
    // 参照
    // ------------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        match self.active {
            Some(ActiveMode::Editing) => Mode::Editing,
            Some(ActiveMode::Playing) => Mode::Playing,
            Some(ActiveMode::Paused) => Mode::Paused,
            None => Mode::Reviewing,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tree(&self) -> &KifuTree {
        &self.tree
    }

    pub fn clock(&self) -> &ClockManager {
        &self.clock
    }

    pub fn clock_snapshot(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }

    pub fn outcome(&self) -> Option<(GameOutcome, EndReason)> {
        self.outcome
    }

    pub fn is_match_running(&self) -> bool {
        self.active == Some(ActiveMode::Playing)
    }

    /// 表示中の局面（編集中は編集中の局面）
    pub fn current_position(&self) -> &Position {
        match &self.edit {
            Some(edit) if self.active == Some(ActiveMode::Editing) => &edit.position,
            _ => &self.tree.current_node().position_after,
        }
    }

    pub fn side_to_move(&self) -> Color {
        self.tree.current_node().side_to_move()
    }

    pub fn selection(&self) -> Option<Square> {
        self.selection
    }

    pub fn select_square(&mut self, square: Option<Square>) {
        self.selection = square;
    }

    pub fn pass_rights(&self) -> Option<PassRights> {
        self.pass_rights
    }

    /// `side` の残りパス権。局面サービスが返した値を優先し、なければ棋譜から数える。
    pub fn remaining_pass_rights(&self, side: Color) -> Option<u8> {
        let initial = self.pass_rights?;
        if let Some(rights) = self.tree.current_node().position_after.pass_rights {
            return Some(rights.get(side));
        }
        let path = self.tree.path_to(self.tree.current_id()).unwrap_or_default();
        let used = path
            .iter()
            .filter_map(|id| self.tree.node(*id))
            .filter(|node| node.usi_move.as_deref() == Some("pass") && node.mover() == Some(side))
            .count();
        Some(initial.get(side).saturating_sub(used.min(u8::MAX as usize) as u8))
    }

    /// 溜まった出来事を取り出す
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// 設定を差し替える（対局中は不可）。プールサイズが変わればプールを作り直す。
    pub fn update_config(&mut self, config: SessionConfig) -> Result<()> {
        if self.is_match_running() {
            return Err(SessionError::InvalidMode(Mode::Playing.label()));
        }
        if config.pool_size != self.config.pool_size {
            self.pool = None;
        }
        self.pass_rights = config.pass.initial_rights();
        self.config = config;
        self.cache.clear();
        Ok(())
    }

    fn query_options(&self) -> LegalQueryOptions {
        LegalQueryOptions {
            pass_rights: self.pass_rights,
        }
    }

    fn set_mode(&mut self, active: Option<ActiveMode>) {
        if self.active != active {
            self.active = active;
            self.events.push(SessionEvent::ModeChanged(self.mode()));
        }
    }

    fn invalidate(&mut self) {
        self.cache.clear();
        self.selection = None;
    }

    // ------------------------------------------------------------------
    // 合法手と指し手の適用
    // ------------------------------------------------------------------

    /// 現在局面の合法手集合（キャッシュ経由）
    pub fn legal_moves(&self) -> Result<LegalMoveSet> {
        let ply = self.tree.current_node().ply;
        let start = self.tree.start();
        let moves = self.tree.current_moves();
        let options = self.query_options();
        let service = self.service.as_ref();
        self.cache
            .get_or_resolve(ply, || service.legal_moves(start, &moves, options))
    }

    /// 人間の入力を受け付けられるか（対局中は手番と担当も確認する）
    fn ensure_human_turn(&self) -> Result<()> {
        match self.mode() {
            Mode::Reviewing => Ok(()),
            Mode::Playing => {
                let side = self.side_to_move();
                if self.config.controller(side) == Controller::Engine {
                    Err(SessionError::NotYourTurn(side.label()))
                } else {
                    Ok(())
                }
            }
            mode => Err(SessionError::InvalidMode(mode.label())),
        }
    }

    /// 盤面操作からの指し手。成り / 不成を選べるのに指定がなければ問い合わせを返す。
    pub fn apply_move(&mut self, input: MoveInput) -> Result<MoveResult> {
        self.ensure_human_turn()?;
        let legal = self.legal_moves()?;
        let token = match input {
            MoveInput::Drop { piece, to } => MoveToken::Drop { piece, to },
            MoveInput::Board { from, to, promote } => {
                let kind = classify_promotion(&legal, from, to)
                    .ok_or_else(|| SessionError::Rejected(format!("illegal move: {from}{to}")))?;
                let promote = match (kind, promote) {
                    (Promotion::None, Some(true)) => {
                        return Err(SessionError::Rejected(format!("{from}{to} cannot promote")));
                    }
                    (Promotion::Forced, Some(false)) => {
                        return Err(SessionError::Rejected(format!("{from}{to} must promote")));
                    }
                    (Promotion::Optional, None) => {
                        return Ok(MoveResult::PromotionChoiceRequired { from, to });
                    }
                    (Promotion::None, _) => false,
                    (Promotion::Forced, _) => true,
                    (Promotion::Optional, Some(choice)) => choice,
                };
                MoveToken::Board { from, to, promote }
            }
        };
        self.commit(token.to_usi(), &legal).map(MoveResult::Applied)
    }

    /// USI 表記の指し手
    pub fn apply_usi(&mut self, token: &str) -> Result<AppliedMove> {
        self.ensure_human_turn()?;
        let token = MoveToken::parse(token)?;
        if token.is_pass() {
            return self.pass_checked();
        }
        let legal = self.legal_moves()?;
        self.commit(token.to_usi(), &legal)
    }

    /// パス（パスルール有効時のみ）
    pub fn pass(&mut self) -> Result<AppliedMove> {
        self.ensure_human_turn()?;
        self.pass_checked()
    }

    fn pass_checked(&mut self) -> Result<AppliedMove> {
        if self.pass_rights.is_none() {
            return Err(SessionError::PassUnavailable("pass rule is disabled".into()));
        }
        let side = self.side_to_move();
        if self.remaining_pass_rights(side).unwrap_or(0) == 0 {
            return Err(SessionError::PassUnavailable(format!(
                "{} has no pass rights left",
                side.label()
            )));
        }
        let legal = self.legal_moves()?;
        if !legal.contains("pass") {
            return Err(SessionError::Rejected("pass is not legal in this position".into()));
        }
        self.commit("pass".to_string(), &legal)
    }

    /// 検証済みの指し手を適用する。局面サービスが拒否したら何も変えない。
    fn commit(&mut self, token: String, legal: &LegalMoveSet) -> Result<AppliedMove> {
        if !legal.contains(&token) {
            return Err(SessionError::Rejected(format!("illegal move: {token}")));
        }
        let mut moves = self.tree.current_moves();
        moves.push(token.clone());
        let replay = self
            .service
            .replay_moves_strict(self.tree.start(), &moves, self.query_options())
            .map_err(SessionError::Rejected)?;
        if !replay.is_complete(moves.len()) {
            let reason = replay
                .error
                .unwrap_or_else(|| format!("{token} could not be applied"));
            return Err(SessionError::Rejected(reason));
        }

        let side = self.side_to_move();
        let playing = self.is_match_running();
        let meta = NodeMeta {
            elapsed_ms: if playing { self.clock.elapsed_in_turn() } else { None },
            eval: None,
        };
        let outcome = self.tree.add_move(&token, replay.position, meta)?;
        if playing && outcome.branch.is_some() {
            // 待った後の指し直しは、指した手順を本譜にする
            self.tree.promote_current_line();
        }
        self.invalidate();
        if playing {
            let next = self.side_to_move();
            self.clock.update_clocks_for_next_turn(next);
        }

        let ply = self.tree.current_node().ply;
        self.events.push(SessionEvent::MoveApplied {
            node_id: outcome.node_id,
            ply,
            usi_move: token.clone(),
            side,
        });
        if let Some(branch) = &outcome.branch {
            self.events.push(SessionEvent::BranchCreated(branch.clone()));
            self.auto_analyze(branch.node_id);
        }
        if playing {
            self.request_engine_move_if_needed();
        }
        Ok(AppliedMove {
            node_id: outcome.node_id,
            usi_move: token,
            ply,
            branch: outcome.branch,
        })
    }

    /// 待った。対局中 / 中断中のみ。
    ///
    /// 戻す手数は、人間側（片方だけが人間ならその側、そうでなければ現在の手番）に
    /// 手番が戻るように 1 手または 2 手。開始局面より前には戻らない。
    pub fn undo(&mut self) -> Result<UndoOutcome> {
        let mode = self.mode();
        if !matches!(mode, Mode::Playing | Mode::Paused) {
            return Err(SessionError::InvalidMode(mode.label()));
        }
        self.clock.stop_ticking();
        if let Some(opponent) = self.opponent.as_mut() {
            opponent.cancel();
        }

        let current = self.side_to_move();
        let target = self.config.single_human_side().unwrap_or(current);
        let wanted: u32 = if target == current { 2 } else { 1 };
        let rewound = wanted.min(self.tree.current_node().ply);
        for _ in 0..rewound {
            self.tree.go_back();
        }
        let side_to_move = if rewound % 2 == 0 {
            current
        } else {
            current.opponent()
        };
        self.invalidate();
        log::debug!("undo: rewound {rewound} plies, {} to move", side_to_move.label());

        if mode == Mode::Playing {
            self.clock.start_ticking(side_to_move);
            self.request_engine_move_if_needed();
        }
        self.events.push(SessionEvent::Undone {
            rewound,
            side_to_move,
        });
        Ok(UndoOutcome {
            rewound,
            side_to_move,
        })
    }

    // ------------------------------------------------------------------
    // モード遷移
    // ------------------------------------------------------------------

    /// 設定の開始局面から対局を始める
    pub fn start_match(&mut self) -> Result<()> {
        let position = resolve_start(self.service.as_ref(), &self.config.start)?;
        let start = self.config.start.clone();
        self.begin_game(position, start);
        Ok(())
    }

    fn begin_game(&mut self, mut position: Position, start: String) {
        self.stop_turn_workers();
        self.pass_rights = self.config.pass.initial_rights();
        position.pass_rights = self.pass_rights;
        self.tree.reset(position, start);
        self.invalidate();
        self.edit = None;
        self.outcome = None;
        self.match_ended.store(false, Ordering::SeqCst);
        self.clock.reset(self.config.clock);
        self.set_mode(Some(ActiveMode::Playing));
        let side = self.side_to_move();
        self.clock.start_ticking(side);
        log::info!("match started, {} to move", side.label());
        self.request_engine_move_if_needed();
    }

    /// 対局中 → 中断
    pub fn pause(&mut self) -> Result<()> {
        if !self.is_match_running() {
            return Err(SessionError::InvalidMode(self.mode().label()));
        }
        self.clock.stop_ticking();
        self.stop_turn_workers();
        self.set_mode(Some(ActiveMode::Paused));
        Ok(())
    }

    /// 中断 → 対局、または確定済みの編集局面から対局を始める
    pub fn resume_auto_play(&mut self) -> Result<()> {
        match self.mode() {
            Mode::Paused => {
                self.resume_from_pause();
                Ok(())
            }
            Mode::Editing => {
                let Some(edit) = self.edit.as_ref() else {
                    return Err(SessionError::InvalidMode(Mode::Editing.label()));
                };
                if edit.dirty {
                    return Err(SessionError::InvalidMode("editing an unfinalized position"));
                }
                if edit.from_pause {
                    self.edit = None;
                    self.resume_from_pause();
                } else {
                    let root = self.tree.root().position_after.clone();
                    let start = self.tree.start().to_string();
                    self.begin_game(root, start);
                }
                Ok(())
            }
            mode => Err(SessionError::InvalidMode(mode.label())),
        }
    }

    fn resume_from_pause(&mut self) {
        self.set_mode(Some(ActiveMode::Playing));
        let side = self.side_to_move();
        self.clock.start_ticking(side);
        self.request_engine_move_if_needed();
    }

    /// 編集モードに入る。対局中・検討中なら現在局面を新しい根にする。
    pub fn enter_edit_mode(&mut self) -> Result<()> {
        match self.mode() {
            Mode::Editing => Ok(()),
            Mode::Paused => {
                self.edit = Some(EditState {
                    position: self.tree.current_node().position_after.clone(),
                    dirty: false,
                    from_pause: true,
                });
                self.set_mode(Some(ActiveMode::Editing));
                Ok(())
            }
            Mode::Playing | Mode::Reviewing => {
                let mut position = self.tree.current_node().position_after.clone();
                let sfen = self
                    .service
                    .board_to_sfen(&position)
                    .map_err(SessionError::Conversion)?;
                self.clock.stop_ticking();
                self.stop_turn_workers();
                position.ply = 0;
                self.tree.reset(position.clone(), sfen);
                self.invalidate();
                self.edit = Some(EditState {
                    position,
                    dirty: false,
                    from_pause: false,
                });
                self.set_mode(Some(ActiveMode::Editing));
                Ok(())
            }
        }
    }

    pub fn set_edit_position(&mut self, position: Position) -> Result<()> {
        match (self.active, self.edit.as_mut()) {
            (Some(ActiveMode::Editing), Some(edit)) => {
                edit.position = position;
                edit.dirty = true;
                self.selection = None;
                Ok(())
            }
            _ => Err(SessionError::InvalidMode(self.mode().label())),
        }
    }

    /// 編集した局面を確定し、その局面を根にする。確定した SFEN を返す。
    pub fn finalize_position(&mut self) -> Result<String> {
        if self.active != Some(ActiveMode::Editing) {
            return Err(SessionError::InvalidMode(self.mode().label()));
        }
        let Some(edit) = self.edit.as_ref() else {
            return Err(SessionError::InvalidMode(Mode::Editing.label()));
        };
        let sfen = self
            .service
            .board_to_sfen(&edit.position)
            .map_err(SessionError::Conversion)?;
        let position = self.service.parse_sfen(&sfen).map_err(SessionError::Conversion)?;
        self.tree.reset(position.clone(), sfen.clone());
        self.invalidate();
        self.edit = Some(EditState {
            position,
            dirty: false,
            from_pause: false,
        });
        Ok(sfen)
    }

    /// 対局を結果なしで打ち切って検討モードへ
    pub fn abort_match(&mut self) -> Result<()> {
        if !matches!(self.mode(), Mode::Playing | Mode::Paused) {
            return Err(SessionError::InvalidMode(self.mode().label()));
        }
        self.clock.stop_ticking();
        self.stop_turn_workers();
        self.set_mode(None);
        Ok(())
    }

    /// 投了。片方だけが人間ならその側、そうでなければ手番側の負け。
    pub fn resign(&mut self) -> Result<()> {
        if !matches!(self.mode(), Mode::Playing | Mode::Paused) {
            return Err(SessionError::InvalidMode(self.mode().label()));
        }
        let loser = self.config.single_human_side().unwrap_or(self.side_to_move());
        self.end_game(GameOutcome::win_for(loser.opponent()), EndReason::Resign);
        Ok(())
    }

    fn end_game(&mut self, outcome: GameOutcome, reason: EndReason) {
        self.match_ended.store(true, Ordering::SeqCst);
        self.clock.stop_ticking();
        self.stop_turn_workers();
        self.outcome = Some((outcome, reason));
        self.set_mode(None);
        log::info!("game over: {} ({})", outcome.as_str(), reason.as_str());
        self.events.push(SessionEvent::GameOver { outcome, reason });
    }

    /// 時間切れを確認する（ティッカーから定期的に呼ぶ）
    pub fn tick(&mut self) -> Option<Color> {
        let expired = self.clock.tick()?;
        self.events.push(SessionEvent::TimeExpired(expired));
        self.end_game(GameOutcome::win_for(expired.opponent()), EndReason::Timeout);
        Some(expired)
    }

    // ------------------------------------------------------------------
    // 対局相手のエンジン
    // ------------------------------------------------------------------

    fn stop_turn_workers(&mut self) {
        if let Some(opponent) = self.opponent.as_mut() {
            opponent.cancel();
        }
    }

    fn request_engine_move_if_needed(&mut self) {
        if !self.is_match_running() || self.match_ended.load(Ordering::SeqCst) {
            return;
        }
        let side = self.side_to_move();
        if self.config.controller(side) != Controller::Engine {
            return;
        }
        let generation = self.tree.generation();
        let node_id = self.tree.current_id();
        let request = SearchRequest {
            sfen: self.tree.start().to_string(),
            moves: self.tree.current_moves(),
            limit: SearchLimit::Clock(self.clock.time_args(side)),
        };
        let Some(opponent) = self.opponent.as_mut() else {
            log::warn!("no engine configured for {}", side.label());
            self.events
                .push(SessionEvent::EngineFailed(format!("no engine configured for {}", side.label())));
            return;
        };
        let ticket = opponent.next_ticket(generation, node_id, side);
        log::debug!("engine request {} for {} at ply {}", ticket.request_id, side.label(), request.moves.len());
        opponent.request(ticket, request);
    }

    /// エンジンの返答を最大 `timeout` 待って取り込む。取り込んだら `true`。
    pub fn wait_for_engine(&mut self, timeout: Duration) -> bool {
        let reply = self.opponent.as_ref().and_then(|o| o.recv_timeout(timeout));
        match reply {
            Some(reply) => {
                self.handle_engine_reply(reply);
                true
            }
            None => false,
        }
    }

    /// ワーカーから届いたもの（エンジンの指し手・解析結果）を取り込む
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(reply) = self.opponent.as_ref().and_then(|o| o.try_recv()) {
            self.handle_engine_reply(reply);
            handled += 1;
        }
        while let Ok(event) = self.analysis_rx.try_recv() {
            self.handle_analysis_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_engine_reply(&mut self, reply: EngineReply) {
        let EngineReply {
            ticket,
            result,
            last_eval,
        } = reply;
        let live = self.is_match_running()
            && !self.match_ended.load(Ordering::SeqCst)
            && self.opponent.as_ref().and_then(|o| o.pending()) == Some(ticket)
            && ticket.generation == self.tree.generation()
            && ticket.node_id == self.tree.current_id()
            && ticket.side == self.side_to_move();
        if !live {
            let usi_move = result.ok().flatten();
            let stale = SessionError::StaleEngineMove(usi_move.clone().unwrap_or_default());
            log::warn!("{stale} (request {}, {})", ticket.request_id, ticket.side.label());
            self.events.push(SessionEvent::EngineMoveDiscarded {
                usi_move,
                side: ticket.side,
            });
            return;
        }
        if let Some(opponent) = self.opponent.as_mut() {
            opponent.settle(&ticket);
        }

        let side = ticket.side;
        match result {
            Err(message) => {
                log::error!("engine failed for {}: {message}", side.label());
                self.events.push(SessionEvent::EngineFailed(message));
            }
            Ok(None) => {
                log::warn!("engine returned no move for {}", side.label());
                self.events
                    .push(SessionEvent::EngineFailed("engine returned no move".into()));
            }
            Ok(Some(mv)) => match mv.as_str() {
                "resign" => self.end_game(GameOutcome::win_for(side.opponent()), EndReason::Resign),
                "win" => self.end_game(GameOutcome::win_for(side), EndReason::DeclareWin),
                _ => match self.apply_engine_move(&mv) {
                    Ok(_) => {
                        // 読みの評価値は探索した局面（指す前のノード）に付ける
                        if let Some(eval) = last_eval {
                            if let Ok(true) = self.tree.record_eval_by_node_id(ticket.node_id, &eval) {
                                let ply = self.tree.node(ticket.node_id).map_or(0, |n| n.ply);
                                self.events.push(SessionEvent::EvalRecorded {
                                    node_id: ticket.node_id,
                                    ply,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("engine played an illegal move {mv}: {e}");
                        self.end_game(GameOutcome::win_for(side.opponent()), EndReason::IllegalMove);
                    }
                },
            },
        }
    }

    fn apply_engine_move(&mut self, mv: &str) -> Result<AppliedMove> {
        let token = MoveToken::parse(mv)?;
        if token.is_pass() {
            return self.pass_checked();
        }
        let legal = self.legal_moves()?;
        self.commit(token.to_usi(), &legal)
    }

    // ------------------------------------------------------------------
    // ナビゲーション（検討モードのみ）
    // ------------------------------------------------------------------

    fn navigate<T>(&mut self, op: impl FnOnce(&mut KifuTree) -> Result<T>) -> Result<T> {
        let mode = self.mode();
        if mode != Mode::Reviewing {
            return Err(SessionError::InvalidMode(mode.label()));
        }
        let result = op(&mut self.tree)?;
        self.invalidate();
        Ok(result)
    }

    pub fn go_back(&mut self) -> Result<bool> {
        self.navigate(|t| Ok(t.go_back()))
    }

    pub fn go_forward(&mut self, hint: Option<NodeId>) -> Result<bool> {
        self.navigate(|t| t.go_forward(hint))
    }

    pub fn go_to_start(&mut self) -> Result<()> {
        self.navigate(|t| {
            t.go_to_start();
            Ok(())
        })
    }

    pub fn go_to_end(&mut self) -> Result<()> {
        self.navigate(|t| {
            t.go_to_end();
            Ok(())
        })
    }

    pub fn go_to_ply(&mut self, ply: u32) -> Result<()> {
        self.navigate(|t| t.go_to_ply(ply))
    }

    pub fn go_to_node(&mut self, id: NodeId) -> Result<()> {
        self.navigate(|t| t.go_to_node(id))
    }

    pub fn switch_branch(&mut self, delta: isize) -> Result<bool> {
        self.navigate(|t| Ok(t.switch_branch(delta)))
    }

    pub fn switch_branch_at_node(&mut self, node_id: NodeId, index: usize) -> Result<bool> {
        self.navigate(|t| t.switch_branch_at_node(node_id, index))
    }

    pub fn promote_current_line(&mut self) -> Result<bool> {
        self.navigate(|t| Ok(t.promote_current_line()))
    }

    /// 読み筋を `ply` 手目からの分岐として追加する
    pub fn add_pv_as_branch(&mut self, ply: u32, pv: &[String]) -> Result<Option<NodeId>> {
        let start = self.tree.start().to_string();
        let options = self.query_options();
        let service = Arc::clone(&self.service);
        let mut created = None;
        let first = self.tree.add_pv_as_branch(
            ply,
            pv,
            |moves| {
                let replay = service.replay_moves_strict(&start, moves, options)?;
                if replay.is_complete(moves.len()) {
                    Ok(replay.position)
                } else {
                    Err(replay.error.unwrap_or_else(|| "principal variation could not be replayed".into()))
                }
            },
            |branch| created = Some(branch.clone()),
        )?;
        self.invalidate();
        if let Some(branch) = created {
            let id = branch.node_id;
            self.events.push(SessionEvent::BranchCreated(branch));
            self.auto_analyze(id);
        }
        Ok(first)
    }

    // ------------------------------------------------------------------
    // 解析
    // ------------------------------------------------------------------

    fn ensure_pool(&mut self) -> std::result::Result<&EnginePool, PoolError> {
        if self.pool.is_none() {
            let factory = self
                .engine_factory
                .clone()
                .ok_or_else(|| PoolError::EngineUnavailable("no engine configured".into()))?;
            self.pool = Some(EnginePool::new(self.config.pool_size, factory)?);
        }
        self.pool.as_ref().ok_or(PoolError::EmptyPool)
    }

    /// ジョブを解析プールへ投入する。結果は `process_pending` でツリーに記録される。
    pub fn start_analysis(&mut self, jobs: Vec<AnalysisJob>) -> Result<()> {
        let tx = self.analysis_tx.clone();
        let pool = self.ensure_pool()?;
        pool.start(jobs, move |event| {
            let _ = tx.send(event);
        })?;
        Ok(())
    }

    /// 本譜全体を解析する。投入したジョブ数を返す。
    pub fn analyze_main_line(&mut self) -> Result<usize> {
        let jobs = analysis::jobs_for_main_line(&self.tree, self.config.analysis);
        let count = jobs.len();
        self.start_analysis(jobs)?;
        Ok(count)
    }

    /// 根から `id` までを解析する
    pub fn analyze_path_to(&mut self, id: NodeId) -> Result<usize> {
        let jobs = analysis::jobs_for_path_to(&self.tree, id, self.config.analysis)?;
        let count = jobs.len();
        self.start_analysis(jobs)?;
        Ok(count)
    }

    pub fn cancel_analysis(&self) {
        if let Some(pool) = &self.pool {
            pool.cancel();
        }
    }

    pub fn is_analysis_running(&self) -> bool {
        self.pool.as_ref().is_some_and(EnginePool::is_running)
    }

    /// 解析バッチの終了を待って結果を取り込む
    pub fn wait_for_analysis(&mut self) -> usize {
        if let Some(pool) = &self.pool {
            pool.wait();
        }
        self.process_pending()
    }

    fn auto_analyze(&mut self, id: NodeId) {
        if !self.config.auto_analyze_branches {
            return;
        }
        let job = match analysis::job_for_node(&self.tree, id, self.config.analysis) {
            Ok(job) => job,
            Err(e) => {
                log::debug!("auto analysis skipped: {e}");
                return;
            }
        };
        if let Err(e) = self.start_analysis(vec![job]) {
            log::debug!("auto analysis skipped: {e}");
        }
    }

    fn handle_analysis_event(&mut self, event: AnalysisEvent) {
        match event {
            AnalysisEvent::Result {
                ply,
                node_id,
                generation,
                event,
            } => {
                if generation != self.tree.generation() {
                    log::debug!("dropping analysis result for ply {ply} from generation {generation}");
                    self.events.push(SessionEvent::AnalysisDropped { ply });
                    return;
                }
                let target = match node_id {
                    Some(id) => Ok(id),
                    None => self.tree.node_at_ply(ply).ok_or(SessionError::NoSuchPly(ply)),
                };
                match target.and_then(|id| self.tree.record_eval_by_node_id(id, &event).map(|s| (id, s))) {
                    Ok((node_id, true)) => self.events.push(SessionEvent::EvalRecorded { node_id, ply }),
                    Ok((_, false)) => {}
                    Err(e) => {
                        log::debug!("dropping analysis result for ply {ply}: {e}");
                        self.events.push(SessionEvent::AnalysisDropped { ply });
                    }
                }
            }
            other => self.events.push(SessionEvent::Analysis(other)),
        }
    }

    // ------------------------------------------------------------------
    // 棋譜の取り込み / 書き出し
    // ------------------------------------------------------------------

    /// 分解済みの棋譜を取り込んで検討モードにする。
    /// どれか 1 手でも再生できなければツリーは元のまま。
    pub fn load_record(&mut self, record: ImportedRecord) -> Result<()> {
        if self.is_match_running() {
            return Err(SessionError::InvalidMode(Mode::Playing.label()));
        }
        let root = resolve_start(self.service.as_ref(), &record.start)?;
        let tokens = record
            .moves
            .iter()
            .map(|m| MoveToken::parse(&m.token).map(|t| t.to_usi()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let options = self.query_options();
        let mut positions = Vec::with_capacity(tokens.len());
        for n in 1..=tokens.len() {
            let replay = self
                .service
                .replay_moves_strict(&record.start, &tokens[..n], options)
                .map_err(SessionError::Conversion)?;
            if !replay.is_complete(n) {
                return Err(SessionError::Conversion(format!(
                    "move {n} ({}): {}",
                    tokens[n - 1],
                    replay.error.unwrap_or_else(|| "could not be replayed".into())
                )));
            }
            positions.push(replay.position);
        }

        self.clock.stop_ticking();
        self.stop_turn_workers();
        self.tree.reset(root, record.start.clone());
        for ((token, imported), position) in tokens.iter().zip(&record.moves).zip(positions) {
            let eval = imported_eval(imported)
                .and_then(|event| NodeEval::from_event(&event, position.turn));
            let meta = NodeMeta {
                elapsed_ms: imported.elapsed_ms,
                eval,
            };
            self.tree.add_move(token, position, meta)?;
        }
        self.invalidate();
        self.edit = None;
        self.outcome = None;
        self.set_mode(None);
        log::info!("loaded record with {} moves", tokens.len());
        Ok(())
    }

    /// 本譜を `<開始表記> moves …` で書き出す
    pub fn export_usi(&self) -> String {
        self.tree.record().to_notation()
    }

    /// 本譜を JSONL（ヘッダ行 + 1 手 1 行）で書き出す
    pub fn export_jsonl<W: Write>(&self, writer: W) -> std::io::Result<()> {
        let meta = RecordMeta {
            kind: "meta",
            timestamp: chrono::Local::now().to_rfc3339(),
            start: self.tree.start().to_string(),
            sente: self.config.sente.to_string(),
            gote: self.config.gote.to_string(),
            outcome: self.outcome.map(|(o, _)| o.as_str()),
            reason: self.outcome.map(|(_, r)| r.as_str().to_string()),
        };
        let entries: Vec<RecordMoveEntry> = self
            .tree
            .main_line()
            .into_iter()
            .filter_map(|id| self.tree.node(id))
            .filter_map(|node| {
                Some(RecordMoveEntry {
                    kind: "move",
                    ply: node.ply,
                    side_to_move: node.mover()?,
                    move_usi: node.usi_move.clone()?,
                    elapsed_ms: node.elapsed_ms,
                    eval: node.eval.clone(),
                })
            })
            .collect();
        write_jsonl(writer, &meta, &entries)
    }
}
