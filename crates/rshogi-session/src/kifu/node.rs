use std::fmt;

use serde::{Deserialize, Serialize};

use crate::position::Position;
use crate::types::{Color, NodeEval};

/// ノード ID
///
/// ツリーのリセットをまたいでも再利用しない連番。本譜の入れ替えでも変わらない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 棋譜ツリーの 1 ノード
///
/// 作成後に変わるのは `children`（追加・並べ替え）と `eval`（追記）だけ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KifuNode {
    pub id: NodeId,
    /// 開始局面からの手数（ルート = 0）
    pub ply: u32,
    /// このノードに至った指し手（ルートは `None`）
    pub usi_move: Option<String>,
    pub position_after: Position,
    pub parent: Option<NodeId>,
    /// 先頭が本譜
    pub children: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<NodeEval>,
}

impl KifuNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// このノードの局面で次に指す側
    pub fn side_to_move(&self) -> Color {
        self.position_after.turn
    }

    /// このノードの指し手を指した側（ルートは `None`）
    pub fn mover(&self) -> Option<Color> {
        self.usi_move.as_ref().map(|_| self.position_after.turn.opponent())
    }
}

/// `add_move` に添える手ごとの情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMeta {
    pub elapsed_ms: Option<u64>,
    pub eval: Option<NodeEval>,
}

impl NodeMeta {
    pub fn elapsed(ms: u64) -> Self {
        Self {
            elapsed_ms: Some(ms),
            eval: None,
        }
    }
}

/// 分岐が新しくできたことの通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCreated {
    /// 分岐の最初の指し手の手数
    pub ply: u32,
    pub first_move: String,
    pub node_id: NodeId,
}

/// `add_move` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMoveOutcome {
    pub node_id: NodeId,
    /// 新しいノードを作った（既存の子へ進んだだけなら `false`）
    pub created: bool,
    pub branch: Option<BranchCreated>,
}
