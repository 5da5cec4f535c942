use std::collections::HashMap;

use crate::error::{Result, SessionError};
use crate::position::Position;
use crate::record::{GameRecord, MoveToken};
use crate::types::{EvalEvent, NodeEval};

use super::node::{AddMoveOutcome, BranchCreated, KifuNode, NodeId, NodeMeta};

/// 分岐付きの棋譜ツリー
///
/// ノードは ID をキーにしたアリーナに置き、親子関係はすべて ID で辿る。
/// `reset` のたびに世代（generation）が進み、古い世代に向けた解析結果を捨てられる。
#[derive(Debug, Clone)]
pub struct KifuTree {
    nodes: HashMap<NodeId, KifuNode>,
    root_id: NodeId,
    current: NodeId,
    /// 開始局面の表記（`startpos` または SFEN）
    start: String,
    generation: u64,
    next_id: u64,
}

impl KifuTree {
    pub fn new(position: Position, start: impl Into<String>) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            root_id: NodeId(0),
            current: NodeId(0),
            start: String::new(),
            generation: 0,
            next_id: 0,
        };
        tree.install_root(position, start.into());
        tree
    }

    /// ツリーを捨てて `position` を根にする
    pub fn reset(&mut self, position: Position, start: impl Into<String>) {
        self.nodes.clear();
        self.generation += 1;
        self.install_root(position, start.into());
        log::debug!("kifu: reset (generation {})", self.generation);
    }

    fn install_root(&mut self, position: Position, start: String) {
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            KifuNode {
                id,
                ply: 0,
                usi_move: None,
                position_after: position,
                parent: None,
                children: Vec::new(),
                elapsed_ms: None,
                eval: None,
            },
        );
        self.root_id = id;
        self.current = id;
        self.start = start;
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // 参照
    // ------------------------------------------------------------------

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn current_id(&self) -> NodeId {
        self.current
    }

    pub fn node(&self, id: NodeId) -> Option<&KifuNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn current_node(&self) -> &KifuNode {
        &self.nodes[&self.current]
    }

    pub fn root(&self) -> &KifuNode {
        &self.nodes[&self.root_id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    fn get(&self, id: NodeId) -> Result<&KifuNode> {
        self.nodes.get(&id).ok_or(SessionError::UnknownNode(id))
    }

    /// 根から `id` までの経路（両端を含む）
    pub fn path_to(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut path = vec![id];
        let mut cursor = self.get(id)?;
        while let Some(parent) = cursor.parent {
            path.push(parent);
            cursor = self.get(parent)?;
        }
        path.reverse();
        Ok(path)
    }

    /// 根から `id` までの指し手列
    pub fn moves_to(&self, id: NodeId) -> Result<Vec<String>> {
        Ok(self
            .path_to(id)?
            .into_iter()
            .filter_map(|n| self.nodes[&n].usi_move.clone())
            .collect())
    }

    pub fn current_moves(&self) -> Vec<String> {
        self.moves_to(self.current).unwrap_or_default()
    }

    fn follow_first_children(&self, from: NodeId, line: &mut Vec<NodeId>) {
        let mut cursor = from;
        while let Some(&next) = self.nodes[&cursor].children.first() {
            line.push(next);
            cursor = next;
        }
    }

    /// 現在の手順: 根 → 現在ノード → 以降は各ノードの先頭の子
    pub fn current_line(&self) -> Vec<NodeId> {
        let mut line = self.path_to(self.current).unwrap_or_else(|_| vec![self.root_id]);
        self.follow_first_children(self.current, &mut line);
        line
    }

    /// 本譜: 根から先頭の子を辿った手順
    pub fn main_line(&self) -> Vec<NodeId> {
        let mut line = vec![self.root_id];
        self.follow_first_children(self.root_id, &mut line);
        line
    }

    pub fn main_line_moves(&self) -> Vec<String> {
        self.main_line()
            .into_iter()
            .filter_map(|id| self.nodes[&id].usi_move.clone())
            .collect()
    }

    /// 本譜を `<開始表記> moves …` の形で返す
    pub fn record(&self) -> GameRecord {
        GameRecord::new(self.start.clone(), self.main_line_moves())
    }

    /// 現在の手順上で `ply` 手目のノード
    pub fn node_at_ply(&self, ply: u32) -> Option<NodeId> {
        self.current_line().into_iter().find(|id| self.nodes[id].ply == ply)
    }

    // ------------------------------------------------------------------
    // 指し手の追加
    // ------------------------------------------------------------------

    /// 現在ノードに指し手を追加して進む。
    ///
    /// 同じ指し手の子が既にあればそこへ進むだけで、ノードは増えない。
    /// 子を持つノードへ新しい指し手を追加した場合は分岐作成として報告する。
    pub fn add_move(
        &mut self,
        token: &str,
        position_after: Position,
        meta: NodeMeta,
    ) -> Result<AddMoveOutcome> {
        let usi = MoveToken::parse(token)?.to_usi();
        let parent_id = self.current;

        if let Some(existing) = self.child_with_move(parent_id, &usi) {
            self.current = existing;
            if let Some(eval) = meta.eval {
                self.store_eval(existing, eval);
            }
            return Ok(AddMoveOutcome {
                node_id: existing,
                created: false,
                branch: None,
            });
        }

        let parent_ply = self.nodes[&parent_id].ply;
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            KifuNode {
                id,
                ply: parent_ply + 1,
                usi_move: Some(usi.clone()),
                position_after,
                parent: Some(parent_id),
                children: Vec::new(),
                elapsed_ms: meta.elapsed_ms,
                eval: meta.eval,
            },
        );
        let siblings = &mut self
            .nodes
            .get_mut(&parent_id)
            .ok_or(SessionError::UnknownNode(parent_id))?
            .children;
        let branch = (!siblings.is_empty()).then(|| BranchCreated {
            ply: parent_ply + 1,
            first_move: usi.clone(),
            node_id: id,
        });
        siblings.push(id);
        self.current = id;
        if let Some(branch) = &branch {
            log::debug!("kifu: branch created at ply {} ({})", branch.ply, branch.first_move);
        }
        Ok(AddMoveOutcome {
            node_id: id,
            created: true,
            branch,
        })
    }

    fn child_with_move(&self, parent: NodeId, usi: &str) -> Option<NodeId> {
        self.nodes[&parent]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child].usi_move.as_deref() == Some(usi))
    }

    /// 読み筋を `ply` 手目の局面からの分岐として挿入する。
    ///
    /// 既存の子と一致する手はそこへ合流する。`position_after` には根からの指し手列を渡し、
    /// その直後の局面を返させる。どれか 1 手でも局面を作れなければ何も挿入しない。
    /// 現在ノードは動かさない。新しいノードを作ったら先頭のノード ID を返す。
    pub fn add_pv_as_branch<P, C>(
        &mut self,
        ply: u32,
        pv: &[String],
        mut position_after: P,
        on_branch_created: C,
    ) -> Result<Option<NodeId>>
    where
        P: FnMut(&[String]) -> std::result::Result<Position, String>,
        C: FnOnce(&BranchCreated),
    {
        let anchor = self.node_at_ply(ply).ok_or(SessionError::NoSuchPly(ply))?;
        let tokens = pv
            .iter()
            .map(|mv| MoveToken::parse(mv).map(|t| t.to_usi()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut cursor = anchor;
        let mut matched = 0;
        for mv in &tokens {
            match self.child_with_move(cursor, mv) {
                Some(child) => {
                    cursor = child;
                    matched += 1;
                }
                None => break,
            }
        }
        if matched == tokens.len() {
            return Ok(None);
        }

        let mut moves = self.moves_to(cursor)?;
        let mut positions = Vec::with_capacity(tokens.len() - matched);
        for mv in &tokens[matched..] {
            moves.push(mv.clone());
            positions.push(position_after(&moves).map_err(SessionError::Conversion)?);
        }

        let fork = cursor;
        let fork_had_children = !self.nodes[&fork].children.is_empty();
        let mut first_new = None;
        for (mv, position) in tokens[matched..].iter().zip(positions) {
            let parent_ply = self.nodes[&cursor].ply;
            let id = self.alloc_id();
            self.nodes.insert(
                id,
                KifuNode {
                    id,
                    ply: parent_ply + 1,
                    usi_move: Some(mv.clone()),
                    position_after: position,
                    parent: Some(cursor),
                    children: Vec::new(),
                    elapsed_ms: None,
                    eval: None,
                },
            );
            if let Some(parent) = self.nodes.get_mut(&cursor) {
                parent.children.push(id);
            }
            first_new.get_or_insert(id);
            cursor = id;
        }

        if let (true, Some(id)) = (fork_had_children, first_new) {
            let node = &self.nodes[&id];
            on_branch_created(&BranchCreated {
                ply: node.ply,
                first_move: node.usi_move.clone().unwrap_or_default(),
                node_id: id,
            });
        }
        Ok(first_new)
    }

    // ------------------------------------------------------------------
    // ナビゲーション（ノードの中身は変えない）
    // ------------------------------------------------------------------

    /// 1 手戻る。根なら `false`。
    pub fn go_back(&mut self) -> bool {
        match self.current_node().parent {
            Some(parent) => {
                self.current = parent;
                true
            }
            None => false,
        }
    }

    /// 1 手進む。`hint` がなければ先頭の子（本譜側）へ。
    pub fn go_forward(&mut self, hint: Option<NodeId>) -> Result<bool> {
        let children = &self.current_node().children;
        let next = match hint {
            Some(id) => {
                self.get(id)?;
                children.iter().copied().find(|c| *c == id)
            }
            None => children.first().copied(),
        };
        match next {
            Some(id) => {
                self.current = id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn go_to_start(&mut self) {
        self.current = self.root_id;
    }

    /// 現在の手順の末尾まで進む
    pub fn go_to_end(&mut self) {
        let mut cursor = self.current;
        while let Some(&next) = self.nodes[&cursor].children.first() {
            cursor = next;
        }
        self.current = cursor;
    }

    /// 現在の手順上の `ply` 手目へ移動する
    pub fn go_to_ply(&mut self, ply: u32) -> Result<()> {
        let target = self.node_at_ply(ply).ok_or(SessionError::NoSuchPly(ply))?;
        self.current = target;
        Ok(())
    }

    pub fn go_to_node(&mut self, id: NodeId) -> Result<()> {
        self.get(id)?;
        self.current = id;
        Ok(())
    }

    /// 分岐を切り替える（`children` の順序は変えない）。
    ///
    /// 現在ノードから根へ向かって最初に見つかった兄弟を持つノードで、兄弟の中を
    /// `delta` だけ移動する（範囲外は端に丸める）。移動後は先頭の子を辿って、
    /// できる限り元の手数まで戻す。切り替わらなければ `false`。
    pub fn switch_branch(&mut self, delta: isize) -> bool {
        let Some((branch_node, parent)) = self.nearest_branch_point() else {
            return false;
        };
        let siblings = &self.nodes[&parent].children;
        let Some(index) = siblings.iter().position(|c| *c == branch_node) else {
            return false;
        };
        let last = siblings.len() as isize - 1;
        let target = (index as isize + delta).clamp(0, last) as usize;
        if target == index {
            return false;
        }
        let previous_ply = self.current_node().ply;
        let mut cursor = siblings[target];
        while self.nodes[&cursor].ply < previous_ply {
            match self.nodes[&cursor].children.first() {
                Some(&next) => cursor = next,
                None => break,
            }
        }
        self.current = cursor;
        true
    }

    fn nearest_branch_point(&self) -> Option<(NodeId, NodeId)> {
        let mut cursor = self.current;
        loop {
            let parent = self.nodes[&cursor].parent?;
            if self.nodes[&parent].children.len() > 1 {
                return Some((cursor, parent));
            }
            cursor = parent;
        }
    }

    /// `node_id` の `index` 番目の子へ移動する
    pub fn switch_branch_at_node(&mut self, node_id: NodeId, index: usize) -> Result<bool> {
        let node = self.get(node_id)?;
        match node.children.get(index) {
            Some(&child) => {
                self.current = child;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 現在の手順を本譜にする。根までの各分岐点で、経路上の子を先頭へ移す。
    /// 元の本譜は分岐点で 2 番目以降の兄弟になる。並びが変わったら `true`。
    pub fn promote_current_line(&mut self) -> bool {
        let path = self.path_to(self.current).unwrap_or_default();
        let mut changed = false;
        for pair in path.windows(2) {
            let (parent, child) = (pair[0], pair[1]);
            if let Some(node) = self.nodes.get_mut(&parent) {
                if let Some(pos) = node.children.iter().position(|c| *c == child) {
                    if pos != 0 {
                        let id = node.children.remove(pos);
                        node.children.insert(0, id);
                        changed = true;
                    }
                }
            }
        }
        if changed {
            log::debug!("kifu: promoted line ending at ply {}", self.current_node().ply);
        }
        changed
    }

    // ------------------------------------------------------------------
    // 解析結果
    // ------------------------------------------------------------------

    /// 現在の手順上の `ply` 手目に評価値を記録する。保存したら `true`。
    pub fn record_eval_by_ply(&mut self, ply: u32, event: &EvalEvent) -> Result<bool> {
        let id = self.node_at_ply(ply).ok_or(SessionError::NoSuchPly(ply))?;
        self.record_eval_by_node_id(id, event)
    }

    /// ノード ID を指定して評価値を記録する（本譜外の解析用）。
    ///
    /// スコアのないイベントと、既存より浅い結果は保存しない。
    /// 同じ深さ以上の結果は既存の評価値を置き換える（ノードの指し手や親子関係は変えない）。
    pub fn record_eval_by_node_id(&mut self, id: NodeId, event: &EvalEvent) -> Result<bool> {
        let side = self.get(id)?.side_to_move();
        match NodeEval::from_event(event, side) {
            Some(eval) => Ok(self.store_eval(id, eval)),
            None => Ok(false),
        }
    }

    fn store_eval(&mut self, id: NodeId, eval: NodeEval) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.eval.as_ref().is_some_and(|old| old.depth > eval.depth) {
            return false;
        }
        node.eval = Some(eval);
        true
    }
}
