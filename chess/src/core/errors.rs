use thiserror::Error;

/// Errors raised while parsing a FEN string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FenError {
    #[error("FEN is missing the '{0}' field")]
    MissingField(&'static str),
    #[error("Invalid piece character '{0}' in board field")]
    InvalidPiece(char),
    #[error("Board field describes {0} ranks, expected 8")]
    BadRankCount(usize),
    #[error("Rank '{0}' does not describe exactly 8 files")]
    BadRankWidth(String),
    #[error("Invalid side to move '{0}', expected 'w' or 'b'")]
    InvalidSideToMove(String),
    #[error("Invalid castling field '{0}'")]
    InvalidCastling(String),
    #[error("Invalid square '{0}'")]
    InvalidSquare(String),
}
