//! Axum Handlers for the plain HTTP endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use mojitalk_core::persistence::UserKey;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::state::AppState;

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub enum ApiError {
    BadRequest(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Deletes the persisted chat history of a user, e.g. after account deletion.
///
/// Open conversations of that user are reset as well.
pub async fn delete_history(
    State(state): State<Arc<AppState>>,
    Path(user_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    if user_key.trim().is_empty() {
        return Err(ApiError::BadRequest("user key is required".to_string()));
    }
    clear_history(&state, UserKey::from_user_id(Some(&user_key))).await
}

/// Deletes the shared guest history.
pub async fn delete_guest_history(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    clear_history(&state, UserKey::Guest).await
}

async fn clear_history(state: &AppState, key: UserKey) -> Result<StatusCode, ApiError> {
    let reset = state.live.clear_user(&key, state.history.as_ref()).await?;
    info!(user = %key, open_conversations = reset, "Chat history deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::{test_config, test_prompts};
    use mojitalk_core::{Message, store::ConversationStore};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_delete_history_removes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(AppState::from_config(test_config(dir.path()), test_prompts()).unwrap());
        let key = UserKey::User("erin".into());
        state
            .history
            .save(&key, &[Message::user_text("消して")])
            .await
            .unwrap();
        assert!(dir.path().join("history/chat_history_erin.json").exists());

        let status = delete_history(State(state.clone()), Path("erin".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.history.load(&key).await.unwrap().is_none());

        // Deleting again is fine.
        let status = delete_history(State(state), Path("erin".to_string())).await.ok().unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_delete_history_rejects_blank_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(AppState::from_config(test_config(dir.path()), test_prompts()).unwrap());
        let result = delete_history(State(state), Path("  ".to_string())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_delete_history_resets_open_conversation() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(AppState::from_config(test_config(dir.path()), test_prompts()).unwrap());
        let key = UserKey::User("erin".into());
        let file = dir.path().join("history/chat_history_erin.json");

        let store = ConversationStore::with_quiet_period(
            state.history.clone(),
            state.config.language,
            Duration::from_millis(200),
        );
        store.switch_user(key.clone()).await;
        store.append(Message::user_text("一つ目")).await;
        store.flush().await;
        assert!(file.exists());
        state.live.register(Uuid::new_v4(), store.clone()).await;

        // Leaves a save pending when the delete arrives.
        store.append(Message::user_text("二つ目")).await;
        let status = delete_history(State(state.clone()), Path("erin".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!file.exists());
        let messages = store.snapshot().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, mojitalk_core::Sender::Ai);
    }

    #[tokio::test]
    async fn test_delete_history_leaves_other_users_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(AppState::from_config(test_config(dir.path()), test_prompts()).unwrap());
        let store = ConversationStore::new(state.history.clone(), state.config.language);
        store.switch_user(UserKey::User("gina".into())).await;
        store.append(Message::user_text("まだ")).await;
        state.live.register(Uuid::new_v4(), store.clone()).await;

        delete_history(State(state), Path("erin".to_string())).await.ok().unwrap();
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_guest_history_is_separate_from_user_named_guest() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(AppState::from_config(test_config(dir.path()), test_prompts()).unwrap());
        let named = UserKey::User("guest".into());
        state.history.save(&UserKey::Guest, &[Message::user_text("ゲスト")]).await.unwrap();
        state.history.save(&named, &[Message::user_text("名前")]).await.unwrap();

        let status = delete_guest_history(State(state.clone())).await.ok().unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.history.load(&UserKey::Guest).await.unwrap().is_none());
        assert!(state.history.load(&named).await.unwrap().is_some());

        delete_history(State(state.clone()), Path("guest".to_string())).await.ok().unwrap();
        assert!(state.history.load(&named).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body.status, "ok");
    }
}
