//! Direct-message REST surface: conversation summaries, history, send and
//! read receipts. Live delivery happens over the push channel (`ws`).

pub mod conversations;
pub mod history;
pub mod read;
