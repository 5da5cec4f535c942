//! 一括解析
//!
//! 棋譜ツリーのスナップショットから [`AnalysisJob`] を作り、[`EnginePool`] で並列に解析する。
//! ジョブは作成時のツリー世代を持つので、ツリーがリセットされた後に届いた結果は
//! 受け手側で捨てられる。

mod pool;

use serde::{Deserialize, Serialize};

use crate::engine::SearchRequest;
use crate::error::Result;
use crate::kifu::{KifuTree, NodeId};
use crate::types::EvalEvent;

pub use pool::{EnginePool, WORKER_POLL_INTERVAL};

/// 1 局面あたりの解析条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            time_ms: 3000,
            depth: None,
        }
    }
}

/// 解析ジョブ（投入後は変更しない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub ply: u32,
    /// 開始局面の表記（`startpos` または SFEN）
    pub sfen: String,
    pub moves: Vec<String>,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// 作成時のツリー世代
    pub generation: u64,
}

impl AnalysisJob {
    pub fn request(&self) -> SearchRequest {
        SearchRequest::analysis(self.sfen.clone(), self.moves.clone(), self.time_ms, self.depth)
    }
}

/// 進捗
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisProgress {
    pub completed: usize,
    pub total: usize,
    /// 現在ワーカーに割り当てられているジョブの手数
    pub in_progress: Vec<u32>,
}

/// プールから呼び出し側へ流れる通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisEvent {
    Result {
        ply: u32,
        node_id: Option<NodeId>,
        generation: u64,
        event: EvalEvent,
    },
    Error {
        ply: u32,
        node_id: Option<NodeId>,
        message: String,
    },
    Progress(AnalysisProgress),
    /// バッチごとにちょうど 1 回
    Complete { completed: usize, total: usize, cancelled: bool },
}

/// `id` の局面を解析するジョブ
pub fn job_for_node(tree: &KifuTree, id: NodeId, settings: AnalysisSettings) -> Result<AnalysisJob> {
    let moves = tree.moves_to(id)?;
    let ply = tree.node(id).map_or(moves.len() as u32, |n| n.ply);
    Ok(AnalysisJob {
        ply,
        sfen: tree.start().to_string(),
        moves,
        time_ms: settings.time_ms,
        depth: settings.depth,
        node_id: Some(id),
        generation: tree.generation(),
    })
}

/// 本譜の全局面（開始局面を含む）
pub fn jobs_for_main_line(tree: &KifuTree, settings: AnalysisSettings) -> Vec<AnalysisJob> {
    jobs_for_ids(tree, &tree.main_line(), settings)
}

/// 根から `id` までの全局面（分岐上のノードにも使える）
pub fn jobs_for_path_to(
    tree: &KifuTree,
    id: NodeId,
    settings: AnalysisSettings,
) -> Result<Vec<AnalysisJob>> {
    let path = tree.path_to(id)?;
    Ok(jobs_for_ids(tree, &path, settings))
}

fn jobs_for_ids(tree: &KifuTree, ids: &[NodeId], settings: AnalysisSettings) -> Vec<AnalysisJob> {
    let mut moves = Vec::new();
    ids.iter()
        .filter_map(|id| tree.node(*id))
        .map(|node| {
            if let Some(mv) = &node.usi_move {
                moves.push(mv.clone());
            }
            AnalysisJob {
                ply: node.ply,
                sfen: tree.start().to_string(),
                moves: moves.clone(),
                time_ms: settings.time_ms,
                depth: settings.depth,
                node_id: Some(node.id),
                generation: tree.generation(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kifu::NodeMeta;
    use crate::position::Position;
    use crate::types::Color;

    fn sample_tree() -> (KifuTree, Vec<NodeId>) {
        let mut tree = KifuTree::new(Position::empty(Color::Black, 0), "startpos");
        let mut ids = Vec::new();
        for (i, mv) in ["7g7f", "3c3d", "2g2f"].iter().enumerate() {
            let ply = i as u32 + 1;
            let pos = Position::empty(Color::after_plies(Color::Black, ply), ply);
            ids.push(tree.add_move(mv, pos, NodeMeta::default()).unwrap().node_id);
        }
        (tree, ids)
    }

    #[test]
    fn main_line_jobs_cover_every_position() {
        let (tree, ids) = sample_tree();
        let settings = AnalysisSettings { time_ms: 500, depth: Some(10) };
        let jobs = jobs_for_main_line(&tree, settings);
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0].ply, 0);
        assert!(jobs[0].moves.is_empty());
        assert_eq!(jobs[3].moves, vec!["7g7f", "3c3d", "2g2f"]);
        assert_eq!(jobs[3].node_id, Some(ids[2]));
        assert!(jobs.iter().all(|j| j.generation == tree.generation() && j.time_ms == 500));
        assert_eq!(jobs[2].request().position_command(), "position startpos moves 7g7f 3c3d");
    }

    #[test]
    fn path_jobs_follow_branch() {
        let (mut tree, ids) = sample_tree();
        tree.go_to_node(ids[0]).unwrap();
        let pos = Position::empty(Color::Black, 2);
        let branch = tree.add_move("8c8d", pos, NodeMeta::default()).unwrap().node_id;
        let jobs = jobs_for_path_to(&tree, branch, AnalysisSettings::default()).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].moves, vec!["7g7f", "8c8d"]);
        let single = job_for_node(&tree, branch, AnalysisSettings::default()).unwrap();
        assert_eq!(single, jobs[2]);
    }
}
