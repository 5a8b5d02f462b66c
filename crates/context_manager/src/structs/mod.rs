pub mod tree;
pub mod turn;
