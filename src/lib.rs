pub mod api;
pub mod catalog;
pub mod commands;
pub mod connection;
pub mod discovery;
pub mod homie;
pub mod output;
