pub mod agent;
pub mod application;
pub mod chat;
pub mod search;
pub mod trace;
pub mod webserver;
