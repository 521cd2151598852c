//! HTTP-level tests: playlists, on-demand segments and full-video playback
//! served end-to-end through the Axum surface.

#![cfg(unix)]

mod common;

use common::TestHarness;

#[tokio::test]
async fn health_check_responds() {
    let (_h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn master_playlist_lists_the_ladder() {
    let (h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(h.vod_url(addr, "index.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/vnd.apple.mpegurl"
    );

    let body = resp.text().await.unwrap();
    assert!(body.starts_with("#EXTM3U"));
    // 1080p 8 Mbps h264 source: 480p and 720p rungs plus passthrough
    assert!(body.contains("480p.m3u8"));
    assert!(body.contains("720p.m3u8"));
    assert!(body.contains("max.m3u8"));
    assert!(!body.contains("1080p.m3u8"));
    assert!(body.contains("RESOLUTION=1280x720"));
}

#[tokio::test]
async fn media_playlist_is_vod_with_all_segments() {
    let (h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(h.vod_url(addr, "720p.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body = resp.text().await.unwrap();
    assert!(body.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
    assert!(body.contains("#EXT-X-TARGETDURATION:3"));
    // 90 seconds at 3s chunks
    assert_eq!(body.matches("#EXTINF").count(), 30);
    assert!(body.contains("720p-000000.ts"));
    assert!(body.contains("720p-000029.ts"));
    assert!(body.trim_end().ends_with("#EXT-X-ENDLIST"));
}

#[tokio::test]
async fn segment_request_transcodes_on_demand() {
    let (h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(h.vod_url(addr, "720p-000000.ts")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "video/MP2T"
    );

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], b"seg-000000");
}

#[tokio::test]
async fn unknown_quality_is_not_found() {
    let (h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(h.vod_url(addr, "999p.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = reqwest::get(h.vod_url(addr, "999p-000000.ts")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn malformed_segment_name_is_bad_request() {
    let (h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(h.vod_url(addr, "720p-abc.ts")).await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(h.vod_url(addr, "720p.ts")).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn out_of_range_segment_is_not_found() {
    let (h, addr) = TestHarness::with_server().await;

    // Valid name, but the source only has 30 chunks
    let resp = reqwest::get(h.vod_url(addr, "720p-000200.ts")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let (_h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(format!(
        "http://{}/vod/definitely/not/a/file.mp4/index.m3u8",
        addr
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn full_video_passthrough_serves_source_bytes() {
    let (h, addr) = TestHarness::with_server().await;

    // h264 source at quality max: the file itself, no encoder involved
    let resp = reqwest::get(h.vod_url(addr, "max.mp4")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("accept-ranges").unwrap().to_str().unwrap(),
        "bytes"
    );

    let body = resp.bytes().await.unwrap();
    let source = std::fs::read(h.source_path()).unwrap();
    assert_eq!(&body[..], &source[..]);
}

#[tokio::test]
async fn full_video_passthrough_honors_ranges() {
    let (h, addr) = TestHarness::with_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(h.vod_url(addr, "max.mp4"))
        .header("Range", "bytes=100-199")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert!(resp
        .headers()
        .get("content-range")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("bytes 100-199/2048"));

    let body = resp.bytes().await.unwrap();
    let source = std::fs::read(h.source_path()).unwrap();
    assert_eq!(&body[..], &source[100..200]);
}

#[tokio::test]
async fn full_video_transcode_pipes_encoder_output() {
    let (h, addr) = TestHarness::with_server().await;

    // A scaled rung never passes through; the stub encoder pipes fake MP4
    let resp = reqwest::get(h.vod_url(addr, "720p.mp4")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "video/mp4"
    );

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], b"FAKEMP4DATA");
}

#[tokio::test]
async fn repeated_requests_share_one_supervisor() {
    let (h, addr) = TestHarness::with_server().await;

    // Both requests route through the same supervisor and segment directory
    let first = reqwest::get(h.vod_url(addr, "720p-000000.ts")).await.unwrap();
    assert_eq!(first.status(), 200);

    let second = reqwest::get(h.vod_url(addr, "720p-000001.ts")).await.unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(&second.bytes().await.unwrap()[..], b"seg-000001");

    // Exactly one per-source directory exists under the temp root
    let dirs = std::fs::read_dir(&h.config.transcode.temp_dir)
        .unwrap()
        .count();
    assert_eq!(dirs, 1);
}
