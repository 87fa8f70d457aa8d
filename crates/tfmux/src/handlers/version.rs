use axum::Json;

use crate::build_info::{self, BuildInfo};

pub async fn version() -> Json<BuildInfo> {
    Json(build_info::CURRENT)
}
