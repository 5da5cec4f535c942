//! 棋譜ツリー
//!
//! 変化手順を持てる棋譜。ノードは安定した [`NodeId`] で参照し、各ノードの
//! `children` の先頭が本譜になる。本譜を入れ替えるのは [`KifuTree::promote_current_line`]
//! だけで、分岐の切り替え（表示の切り替え）では並び順は変わらない。

mod node;
mod tree;

pub use node::{AddMoveOutcome, BranchCreated, KifuNode, NodeId, NodeMeta};
pub use tree::KifuTree;

#[cfg(test)]
mod tests;
