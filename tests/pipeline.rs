use httpmock::prelude::*;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::{
    io::Cursor,
    time::{Duration, Instant},
};
use vision_chat::{
    AskEngine, AskEngineResult, ChatConfig, ChatError, ChatTurn, ImageKind, ModelId,
    OllamaClient, SessionController, SessionPhase, SessionState, UploadedImage,
};

fn red_png() -> UploadedImage {
    let img = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    UploadedImage::new("red.png", Some(ImageKind::Png), bytes)
}

fn config_for(server: &MockServer) -> ChatConfig {
    ChatConfig::default()
        .with_server_url(server.base_url())
        .with_request_timeout(Duration::from_secs(5))
}

fn mock_llava(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).json_body(json!({
            "models": [{ "name": "llava:latest", "size": 4_733_363_377u64 }]
        }));
    });
}

#[test]
fn question_round_trip_through_the_server() {
    let server = MockServer::start();
    mock_llava(&server);

    let image = red_png().encode().unwrap();
    let generate = server.mock(|when, then| {
        when.method(POST).path("/api/generate").json_body(json!({
            "model": "llava:latest",
            "prompt": "what color is this?",
            "images": [image.as_str()],
            "stream": false
        }));
        then.status(200).json_body(json!({ "response": "red", "done": true }));
    });

    let client = OllamaClient::new(&config_for(&server)).unwrap();
    let controller = SessionController::new(client.clone(), client);
    let mut state = SessionState::new();

    controller.set_model(&mut state, "llava:latest").unwrap();
    controller.set_images(&mut state, &[red_png()]).unwrap();
    let answer = controller
        .submit_question(&mut state, "what color is this?")
        .unwrap();

    generate.assert_hits(1);
    assert_eq!(answer, "red");
    assert_eq!(
        state.transcript(),
        &[
            ChatTurn::user("what color is this?"),
            ChatTurn::assistant("red")
        ]
    );
}

#[test]
fn server_error_keeps_only_the_user_turn() {
    let server = MockServer::start();
    mock_llava(&server);
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(500)
            .json_body(json!({ "error": "model runner has unexpectedly stopped" }));
    });

    let client = OllamaClient::new(&config_for(&server)).unwrap();
    let controller = SessionController::new(client.clone(), client);
    let mut state = SessionState::new();
    controller.set_model(&mut state, "llava").unwrap();
    controller.set_images(&mut state, &[red_png()]).unwrap();

    let err = controller.submit_question(&mut state, "hello?").unwrap_err();

    assert!(matches!(err, ChatError::Inference(ref msg) if msg.contains("unexpectedly stopped")));
    assert_eq!(state.transcript(), &[ChatTurn::user("hello?")]);
    assert_eq!(state.phase(), SessionPhase::Ready);
}

#[test]
fn cached_dispatcher_from_config_skips_repeat_calls() {
    let server = MockServer::start();
    mock_llava(&server);
    let generate = server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200).json_body(json!({ "response": "a red square" }));
    });

    let config = config_for(&server).with_cache_capacity(8);
    let dispatcher = vision_chat::dispatcher_from_config(&config).unwrap();
    let controller = SessionController::new(dispatcher, OllamaClient::new(&config).unwrap());
    let mut state = SessionState::new();
    controller.set_model(&mut state, "llava:latest").unwrap();
    controller.set_images(&mut state, &[red_png()]).unwrap();

    controller.submit_question(&mut state, "describe it").unwrap();
    controller.submit_question(&mut state, "describe it").unwrap();

    generate.assert_hits(1);
    assert_eq!(state.transcript().len(), 4);
}

#[test]
fn engine_answers_a_session_in_the_background() {
    let server = MockServer::start();
    mock_llava(&server);
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200).json_body(json!({ "response": "red" }));
    });

    let client = OllamaClient::new(&config_for(&server)).unwrap();
    let engine = AskEngine::new(client.clone());
    let controller = SessionController::new(client.clone(), client);
    let mut state = SessionState::new();
    controller.set_model(&mut state, "llava:latest").unwrap();
    controller.set_images(&mut state, &[red_png()]).unwrap();

    let request = controller.begin_question(&mut state, "color?").unwrap();
    engine.schedule(7u64, request).unwrap();
    assert_eq!(state.phase(), SessionPhase::Awaiting);

    let deadline = Instant::now() + Duration::from_secs(10);
    let response = loop {
        match engine.try_poll_response() {
            AskEngineResult::Success(response) => break response,
            AskEngineResult::Empty(_) => {
                assert!(Instant::now() < deadline, "no answer in time");
                std::thread::sleep(Duration::from_millis(10));
            }
            AskEngineResult::Error(e) => panic!("{}", e),
        }
    };

    assert_eq!(response.session, 7);
    assert_eq!(response.metadata.model, ModelId::from("llava:latest"));
    assert_eq!(response.metadata.image_count, 1);

    controller.finish_question(&mut state, response.result).unwrap();
    assert_eq!(state.phase(), SessionPhase::Ready);
    assert_eq!(state.transcript().last(), Some(&ChatTurn::assistant("red")));
}
