//! HTTP surface: the static client, a health probe and the two generation
//! endpoints.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json, Multipart, State};
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use glimmer_core::{
    decode_reference, image_to_data_uri, GenerationParams, GenerationRequest, ModelHandle,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<ModelHandle>,
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    image: String,
    status: &'static str,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/text-to-image", post(text_to_image))
        .route("/api/image-to-image", post(image_to_image))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let model = if state.model.is_ready() {
        "ready"
    } else {
        "loading"
    };
    Json(json!({ "status": "ok", "model": model }))
}

async fn text_to_image(
    State(state): State<AppState>,
    body: Result<Json<GenerationParams>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let Json(params) = body?;
    generate(&state, GenerationRequest::TextToImage(params))
        .await
        .map(Json)
}

async fn image_to_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let request = read_image_request(multipart?).await?;
    generate(&state, request).await.map(Json)
}

/// Resolve, invoke and encode; logs every failure with the request context.
async fn generate(
    state: &AppState,
    request: GenerationRequest,
) -> Result<GenerationResponse, ApiError> {
    let mode = request.mode();
    let params = request.params().clone();

    let outcome = async {
        let invocation = request.resolve(state.model.device())?;
        tracing::info!(
            %mode,
            prompt = %invocation.prompt,
            height = invocation.height,
            width = invocation.width,
            steps = invocation.num_inference_steps,
            guidance = invocation.guidance_scale,
            seed = ?invocation.seed(),
            references = invocation.reference_images.len(),
            "generating image"
        );
        let image = state.model.invoke(invocation).await?;
        tokio::task::spawn_blocking(move || image_to_data_uri(&image))
            .await
            .map_err(|e| glimmer_core::Error::Encode(format!("encoding task failed: {e}")))?
    }
    .await;

    match outcome {
        Ok(image) => Ok(GenerationResponse {
            image,
            status: "success",
        }),
        Err(err) => {
            tracing::error!(
                %mode,
                prompt = %params.prompt,
                height = ?params.height,
                width = ?params.width,
                steps = ?params.num_inference_steps,
                seed = ?params.seed,
                error = %err,
                "generation request failed"
            );
            Err(err.into())
        }
    }
}

/// Buffers the multipart body into a request. Files are decoded in upload
/// order on the blocking pool; the first undecodable file fails the whole
/// request.
async fn read_image_request(mut multipart: Multipart) -> Result<GenerationRequest, ApiError> {
    let mut prompt = None;
    let mut params = GenerationParams::default();
    let mut uploads: Vec<(String, Bytes)> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "files" => {
                let file_name = field.file_name().unwrap_or("upload").to_owned();
                let bytes = field.bytes().await?;
                tracing::debug!(file = %file_name, size = bytes.len(), "received reference image");
                uploads.push((file_name, bytes));
            }
            "prompt" => prompt = Some(field.text().await?),
            "height" => params.height = form_value(field).await?,
            "width" => params.width = form_value(field).await?,
            "num_inference_steps" => params.num_inference_steps = form_value(field).await?,
            "guidance_scale" => params.guidance_scale = form_value(field).await?,
            "seed" => params.seed = form_value(field).await?,
            _ => tracing::debug!(field = %name, "ignoring unknown form field"),
        }
    }

    let reference_images = tokio::task::spawn_blocking(move || {
        uploads
            .iter()
            .map(|(name, bytes)| decode_reference(name, bytes))
            .collect::<glimmer_core::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| glimmer_core::Error::Decode {
        name: "upload".to_string(),
        message: format!("decoding task failed: {e}"),
    })??;

    params.prompt = prompt.ok_or_else(|| ApiError::unprocessable("missing form field `prompt`"))?;
    Ok(GenerationRequest::ImageToImage {
        params,
        reference_images,
    })
}

/// Parses a scalar form field; an empty value counts as absent.
async fn form_value<T>(field: Field<'_>) -> Result<Option<T>, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    let name = field.name().unwrap_or_default().to_owned();
    let text = field.text().await?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|e| ApiError::unprocessable(format!("invalid form field `{name}`: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;

    use anyhow::Context;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use glimmer_core::{Device, ImageModel, Invocation, DATA_URI_PREFIX};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use rand::Rng;
    use tower::ServiceExt;

    use super::*;

    const BOUNDARY: &str = "glimmer-test-boundary";

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        prompt: String,
        height: usize,
        width: usize,
        steps: usize,
        guidance: f64,
        seed: Option<u64>,
        references: Vec<(u32, u32)>,
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    /// Records its inputs and paints a small image from the generator's
    /// stream, or from thread-local randomness when there is none.
    struct FakeModel {
        calls: Calls,
        fail: bool,
    }

    impl ImageModel for FakeModel {
        fn generate(&mut self, mut invocation: Invocation) -> anyhow::Result<DynamicImage> {
            self.calls.lock().unwrap().push(Call {
                prompt: invocation.prompt.clone(),
                height: invocation.height,
                width: invocation.width,
                steps: invocation.num_inference_steps,
                guidance: invocation.guidance_scale,
                seed: invocation.seed(),
                references: invocation
                    .reference_images
                    .iter()
                    .map(|img| (img.width(), img.height()))
                    .collect(),
            });
            if self.fail {
                anyhow::bail!("CUDA out of memory");
            }

            let (w, h) = (invocation.width.min(16) as u32, invocation.height.min(16) as u32);
            let len = (w * h * 3) as usize;
            let pixels: Vec<u8> = match invocation.generator.as_mut() {
                Some(generator) => (0..len).map(|_| generator.rng().gen()).collect(),
                None => (0..len).map(|_| rand::random()).collect(),
            };
            let buffer = RgbImage::from_raw(w, h, pixels).context("pixel buffer size")?;
            Ok(DynamicImage::ImageRgb8(buffer))
        }
    }

    fn app_with(fail: bool) -> (Router, Calls) {
        let calls = Calls::default();
        let model = FakeModel {
            calls: calls.clone(),
            fail,
        };
        let handle = ModelHandle::with_model(Device::Cpu, Box::new(model));
        let app = router(
            AppState {
                model: Arc::new(handle),
            },
            16 * 1024 * 1024,
        );
        (app, calls)
    }

    fn app() -> (Router, Calls) {
        app_with(false)
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn multipart_request(files: &[(&str, Vec<u8>)], fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (file_name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; \
                     filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::post("/api/image-to-image")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn text_to_image_applies_defaults() {
        let (app, calls) = app();
        let (status, body) = send(
            app,
            json_request("/api/text-to-image", json!({ "prompt": "a red fox" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert!(body["image"].as_str().unwrap().starts_with(DATA_URI_PREFIX));
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[Call {
                prompt: "a red fox".into(),
                height: 1024,
                width: 1152,
                steps: 50,
                guidance: 1.5,
                seed: Some(42),
                references: vec![],
            }]
        );
    }

    #[tokio::test]
    async fn image_to_image_applies_defaults_and_keeps_upload_order() {
        let (app, calls) = app();
        let request = multipart_request(
            &[("a.png", png(1, 1)), ("b.png", png(2, 1)), ("c.png", png(3, 1))],
            &[("prompt", "as a watercolor")],
        );
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "success");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!((call.height, call.width), (1056, 1024));
        assert_eq!((call.steps, call.guidance, call.seed), (50, 1.5, Some(42)));
        assert_eq!(call.references, vec![(1, 1), (2, 1), (3, 1)]);
    }

    #[tokio::test]
    async fn image_to_image_reads_flat_form_fields() {
        let (app, calls) = app();
        let request = multipart_request(
            &[("a.png", png(4, 4))],
            &[
                ("prompt", "sunset"),
                ("height", "512"),
                ("width", "768"),
                ("num_inference_steps", "8"),
                ("guidance_scale", "3.0"),
                ("seed", "-1"),
            ],
        );
        let (status, _) = send(app, request).await;

        assert_eq!(status, StatusCode::OK);
        let call = calls.lock().unwrap()[0].clone();
        assert_eq!((call.height, call.width, call.steps), (512, 768, 8));
        assert_eq!(call.guidance, 3.0);
        assert_eq!(call.seed, None);
    }

    #[tokio::test]
    async fn blank_prompt_never_reaches_the_model() {
        let (app, calls) = app();
        let (status, body) = send(
            app.clone(),
            json_request("/api/text-to-image", json!({ "prompt": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Please enter a prompt");

        let request = multipart_request(&[("a.png", png(2, 2))], &[("prompt", "")]);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Please enter a prompt");

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_to_image_without_files_is_rejected() {
        let (app, calls) = app();
        let request = multipart_request(&[], &[("prompt", "a castle")]);
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Please upload at least one image");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_upload_fails_the_request() {
        let (app, calls) = app();
        let request = multipart_request(
            &[("ok.png", png(2, 2)), ("broken.png", b"not a png".to_vec())],
            &[("prompt", "x")],
        );
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("broken.png"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_ready_model_returns_503() {
        let app = router(
            AppState {
                model: Arc::new(ModelHandle::new(Device::Cpu)),
            },
            1024 * 1024,
        );
        let (status, body) = send(
            app.clone(),
            json_request("/api/text-to-image", json!({ "prompt": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap().contains("loading"));

        let request = multipart_request(&[("a.png", png(1, 1))], &[("prompt", "x")]);
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn model_failure_is_reported_as_500() {
        let (app, calls) = app_with(true);
        let (status, body) = send(
            app,
            json_request("/api/text-to-image", json!({ "prompt": "x" })),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["detail"],
            "Error generating image: CUDA out of memory"
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn equal_seeds_give_identical_images() {
        let (app, _) = app();
        let body = json!({ "prompt": "x", "height": 16, "width": 16, "seed": 1234 });
        let (_, first) = send(app.clone(), json_request("/api/text-to-image", body.clone())).await;
        let (_, second) = send(app.clone(), json_request("/api/text-to-image", body)).await;
        assert_eq!(first["image"], second["image"]);

        let body = json!({ "prompt": "x", "height": 16, "width": 16, "seed": -1 });
        let (_, first) = send(app.clone(), json_request("/api/text-to-image", body.clone())).await;
        let (_, second) = send(app, json_request("/api/text-to-image", body)).await;
        assert_ne!(first["image"], second["image"]);
    }

    #[tokio::test]
    async fn seeded_image_to_image_is_repeatable() {
        let (app, calls) = app();
        let fields = [
            ("prompt", "as a mosaic"),
            ("height", "16"),
            ("width", "16"),
            ("seed", "99"),
        ];
        let uploads = || vec![("a.png", png(3, 2)), ("b.png", png(5, 5))];

        let (status, first) = send(app.clone(), multipart_request(&uploads(), &fields)).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        let (_, second) = send(app, multipart_request(&uploads(), &fields)).await;

        assert_eq!(first["image"], second["image"]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[0].seed, Some(99));
    }

    #[tokio::test]
    async fn negative_seed_passes_no_generator() {
        let (app, calls) = app();
        send(
            app,
            json_request("/api/text-to-image", json!({ "prompt": "x", "seed": -1 })),
        )
        .await;
        assert_eq!(calls.lock().unwrap()[0].seed, None);
    }

    #[tokio::test]
    async fn malformed_bodies_keep_the_envelope() {
        let (app, calls) = app();
        let request = Request::post("/api/text-to-image")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"prompt\":"))
            .unwrap();
        let (status, body) = send(app.clone(), request).await;
        assert!(status.is_client_error());
        assert!(body["detail"].is_string());

        let request = multipart_request(&[("a.png", png(1, 1))], &[("prompt", "x"), ("seed", "abc")]);
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("seed"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_model_state() {
        let (app, _) = app();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "model": "ready" }));

        let app = router(
            AppState {
                model: Arc::new(ModelHandle::new(Device::Cpu)),
            },
            1024,
        );
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (_, body) = send(app, request).await;
        assert_eq!(body["model"], "loading");
    }

    #[tokio::test]
    async fn index_serves_the_client() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("/api/text-to-image"));
        assert!(html.contains("/api/image-to-image"));
    }
}
