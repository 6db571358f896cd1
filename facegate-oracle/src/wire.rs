//! JSON bodies exchanged with the recognition oracle.

use serde::{Deserialize, Serialize};

pub const REGISTER_PATH: &str = "/register_face";
pub const RECOGNIZE_PATH: &str = "/recognize_face";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Serialize)]
pub struct RegisterFaceRequest<'a> {
    pub resident_id: &'a str,
    pub face_image: String,
}

#[derive(Debug, Serialize)]
pub struct RecognizeFaceRequest {
    pub face_image: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFaceResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecognizeFaceResponse {
    pub success: bool,
    #[serde(default)]
    pub recognized: Option<bool>,
    #[serde(default)]
    pub resident_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}
