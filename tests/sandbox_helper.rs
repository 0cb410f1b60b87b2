//! Integration tests for a forked sandbox helper

use sandbox_zygote::config::settings::ZygoteSettings;
use sandbox_zygote::config::types::ZygoteError;
use sandbox_zygote::helper::{DirectoryFontCatalog, HelperProcess};
use sandbox_zygote::ipc::protocol::FontQuery;
use sandbox_zygote::kernel::process::exit_code;
use sandbox_zygote::worker::FontClient;
use std::io::Read;
use tempfile::TempDir;

fn font_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("Sans-Regular.ttf"), b"sans regular").unwrap();
    std::fs::write(dir.path().join("Sans-Italic.ttf"), b"sans italic").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"not a font").unwrap();
    dir
}

fn spawn_helper(dir: &TempDir) -> (HelperProcess, FontClient) {
    let settings = ZygoteSettings {
        font_directories: vec![dir.path().to_path_buf()],
        default_font_family: "Sans".to_string(),
        ..ZygoteSettings::default()
    };
    let catalog = DirectoryFontCatalog::from_settings(&settings);
    let mut helper = HelperProcess::spawn(&settings, catalog).unwrap();
    let channel = helper.take_worker_channel().unwrap();
    assert!(helper.take_worker_channel().is_none());
    (helper, FontClient::new(channel, settings.channel_limits()))
}

#[test]
fn test_helper_answers_font_requests() {
    let dir = font_dir();
    let (helper, client) = spawn_helper(&dir);

    let found = client
        .match_font(&FontQuery {
            family: "sans".to_string(),
            is_italic: true,
            ..FontQuery::default()
        })
        .unwrap()
        .unwrap();
    assert_eq!(found.family, "Sans");

    let mut content = String::new();
    client
        .open_font(found.fileid)
        .unwrap()
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "sans italic");

    assert!(client.open_font(99).unwrap().is_none());
    assert_eq!(client.family_for_chars(&['a' as u32]).unwrap(), "Sans");
    assert_eq!(client.family_for_chars(&[0xDFFF]).unwrap(), "");

    // Worker leaves first: the helper exits cleanly on its own.
    drop(client);
    let status = helper.shutdown().unwrap();
    assert_eq!(exit_code(&status), Some(0));
}

#[test]
fn test_helper_exits_when_parent_hangs_up() {
    let dir = font_dir();
    let (helper, client) = spawn_helper(&dir);

    // The worker end is still open; only the liveness pipe closes.
    let status = helper.shutdown().unwrap();
    assert_eq!(exit_code(&status), Some(0));

    assert!(client.family_for_chars(&['a' as u32]).is_err());
}

#[test]
fn test_oversized_request_fails_instead_of_blocking() {
    let dir = font_dir();
    let (helper, client) = spawn_helper(&dir);

    let err = client.family_for_chars(&vec![0x41; 3000]).unwrap_err();
    assert!(matches!(err, ZygoteError::Protocol(_)));

    // The helper never saw it and keeps serving.
    assert_eq!(client.family_for_chars(&['a' as u32]).unwrap(), "Sans");

    drop(client);
    let status = helper.shutdown().unwrap();
    assert_eq!(exit_code(&status), Some(0));
}

#[test]
fn test_unknown_family_falls_back_to_default() {
    let dir = font_dir();
    let (helper, client) = spawn_helper(&dir);

    let found = client
        .match_font(&FontQuery {
            family: "Nothing Like It".to_string(),
            ..FontQuery::default()
        })
        .unwrap()
        .unwrap();
    assert_eq!(found.family, "Sans");

    drop(client);
    helper.shutdown().unwrap();
}
