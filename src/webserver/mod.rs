use axum::routing::{get, post};
use axum::Router;

pub mod answer_stream;
pub mod chat;
pub mod health;
pub mod model_selection;
pub mod types;

pub fn chat_router() -> Router {
    Router::new()
        .route("/message", post(chat::send_message))
        .route("/retry", post(chat::retry))
        .route("/stop", post(chat::stop_streaming))
        .route("/", get(chat::get_chat))
        .route("/rename", post(chat::rename_chat))
        .route("/delete", post(chat::delete_chat))
        .route("/bookmark", post(chat::bookmark_chat))
        .route("/history", get(chat::chat_history))
        .route("/favorites", get(chat::chat_favorites))
        .route("/trace", get(chat::chat_trace))
        .route("/feedback", post(chat::message_feedback))
        .route("/followup-questions", post(chat::followup_questions))
        .route("/title", post(chat::regenerate_title))
}
