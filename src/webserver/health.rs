use axum::Extension;

use crate::application::application::Application;

pub async fn health(Extension(app): Extension<Application>) {
    // all the state we need is the db pool being alive
    let _ = app.sql.acquire().await;
}
