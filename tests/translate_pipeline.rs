mod openai_stub;

use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use predicates::prelude::*;
use zip::write::SimpleFileOptions;

use openai_stub::{OpenAiStub, StubBehavior};

const CHAPTER_ONE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" lang="ja">
<head><title>第一話</title><link rel="stylesheet" href="../style.css"/></head>
<body class="main">
<h1>第一話　旅立ち</h1>
<p>朝の光が窓から差し込み、少年はゆっくりと目を覚ました。</p>
<p><ruby>勇者<rt>ゆうしゃ</rt></ruby>は静かに剣を抜き、遠くの山を見つめた。</p>
<div class="illust"><img src="../images/p1.jpg" alt=""/></div>
<p>村の人々は彼の旅立ちを見送るために広場へ集まっていた。</p>
</body>
</html>"#;

const CHAPTER_TWO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" lang="ja">
<head><title>第二話</title></head>
<body>
<h1>第二話　森の中</h1>
<p>深い森の中で、少年は不思議な光を放つ泉を見つけた。</p>
<p>泉の水面には見知らぬ少女の姿がぼんやりと映っていた。</p>
</body>
</html>"#;

const COVER: &str = r#"<html xmlns="http://www.w3.org/1999/xhtml"><body><img src="../images/cover.jpg"/></body></html>"#;

const NAV: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>目次</title></head>
<body><nav epub:type="toc"><ol>
<li><a href="text/ch01.xhtml">第一話</a></li>
<li><a href="text/ch02.xhtml">第二話</a></li>
</ol></nav></body>
</html>"#;

const OPF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="bookid">
<metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
<dc:identifier id="bookid">urn:uuid:12345678-1234-1234-1234-123456789abc</dc:identifier>
<dc:title>異世界の旅</dc:title>
<dc:language>ja</dc:language>
</metadata>
<manifest>
<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
<item id="cover" href="text/cover.xhtml" media-type="application/xhtml+xml"/>
<item id="ch01" href="text/ch01.xhtml" media-type="application/xhtml+xml"/>
<item id="ch02" href="text/ch02.xhtml" media-type="application/xhtml+xml"/>
<item id="css" href="style.css" media-type="text/css"/>
<item id="p1" href="images/p1.jpg" media-type="image/jpeg"/>
</manifest>
<spine>
<itemref idref="cover"/>
<itemref idref="ch01"/>
<itemref idref="ch02"/>
<itemref idref="ch01"/>
</spine>
</package>"#;

const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
<rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

fn write_source_epub(path: &Path) -> anyhow::Result<()> {
    let file = fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("mimetype", stored)?;
    zip.write_all(b"application/epub+zip")?;

    let entries: [(&str, &[u8]); 8] = [
        ("META-INF/container.xml", CONTAINER.as_bytes()),
        ("OEBPS/content.opf", OPF.as_bytes()),
        ("OEBPS/nav.xhtml", NAV.as_bytes()),
        ("OEBPS/text/cover.xhtml", COVER.as_bytes()),
        ("OEBPS/text/ch01.xhtml", CHAPTER_ONE.as_bytes()),
        ("OEBPS/text/ch02.xhtml", CHAPTER_TWO.as_bytes()),
        ("OEBPS/style.css", b"p { text-indent: 1em; }"),
        ("OEBPS/images/p1.jpg", b"\xff\xd8\xff\xe0fakejpeg"),
    ];
    for (name, data) in entries {
        zip.start_file(name, SimpleFileOptions::default())?;
        zip.write_all(data)?;
    }
    zip.finish()?;
    Ok(())
}

fn read_entry(path: &Path, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(fs::File::open(path)?)?;
    let mut entry = archive.by_name(name)?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(data)
}

fn cli() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novel-translator");
    cmd.env_remove("NOVEL_TRANSLATOR_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

fn source_fixture(dir: &Path) -> anyhow::Result<PathBuf> {
    let input = dir.join("novel.epub");
    write_source_epub(&input)?;
    Ok(input)
}

#[test]
fn chapters_lists_narrative_documents_once() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let input = source_fixture(temp.path())?;

    cli()
        .args(["chapters", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("異世界の旅"))
        .stdout(predicate::str::contains("OEBPS/text/ch01.xhtml"))
        .stdout(predicate::str::contains("OEBPS/text/ch02.xhtml"))
        .stdout(predicate::str::contains("cover").not());
    Ok(())
}

#[test]
fn translate_restore_and_scan_round_trip() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let input = source_fixture(temp.path())?;
    let output = temp.path().join("out").join("novel_zh.epub");
    let stub = OpenAiStub::spawn(StubBehavior::Translate);

    cli()
        .args([
            "translate",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--api-key",
            "sk-test",
            "--base-url",
            &stub.base_url,
            "--workers",
            "2",
        ])
        .assert()
        .success();
    assert_eq!(stub.request_count(), 2);

    let chapter = String::from_utf8(read_entry(&output, "OEBPS/text/ch01.xhtml")?)?;
    assert!(chapter.contains(r#"lang="zh""#));
    assert!(chapter.contains(r#"href="../style.css""#));
    assert!(chapter.contains("<h1>第一話　旅立ち</h1>"));
    assert!(chapter.contains("中文第1段"));
    assert!(chapter.contains("<rt>ゆうしゃ</rt>"));
    assert!(chapter.contains("../images/p1.jpg"));
    assert!(!chapter.contains("少年はゆっくりと"));

    let opf = String::from_utf8(read_entry(&output, "OEBPS/content.opf")?)?;
    assert!(opf.contains("<dc:language>zh</dc:language>"));
    assert!(opf.contains("異世界の旅 (中文翻译)"));
    assert_eq!(read_entry(&output, "OEBPS/images/p1.jpg")?, b"\xff\xd8\xff\xe0fakejpeg");

    let checkpoint = temp.path().join("out").join("novel_zh.checkpoint.json");
    assert!(checkpoint.exists());

    // Second run resumes entirely from the checkpoint.
    cli()
        .args([
            "translate",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--api-key",
            "sk-test",
            "--base-url",
            &stub.base_url,
            "--force",
        ])
        .assert()
        .success();
    assert_eq!(stub.request_count(), 2);

    let txt = temp.path().join("novel_zh.txt");
    cli()
        .args([
            "restore",
            "--checkpoint",
            checkpoint.to_str().unwrap(),
            "--source",
            input.to_str().unwrap(),
            "-o",
            txt.to_str().unwrap(),
            "-f",
            "txt",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 chapters written"));
    let text = fs::read_to_string(&txt)?;
    assert!(text.contains(&"=".repeat(40)));
    assert!(text.contains("中文第1段"));

    cli()
        .args([
            "scan",
            "--checkpoint",
            checkpoint.to_str().unwrap(),
            "--rule",
            "第2段=second paragraph",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("OEBPS/text/ch01.xhtml"))
        .stdout(predicate::str::contains("second paragraph"));
    Ok(())
}

#[test]
fn unavailable_provider_leaves_placeholders_and_still_writes() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let input = source_fixture(temp.path())?;
    let output = temp.path().join("novel_zh.txt");
    let stub = OpenAiStub::spawn(StubBehavior::Unavailable);

    cli()
        .args([
            "translate",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-f",
            "txt",
            "--api-key",
            "sk-test",
            "--base-url",
            &stub.base_url,
            "--retries",
            "1",
            "--no-checkpoint",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("chunk translation failed"));

    let text = fs::read_to_string(&output)?;
    assert!(text.contains("[翻译结果为空，以下为原文节选]"));
    assert!(text.contains("朝の光が窓から"));
    assert!(!temp.path().join("novel_zh.checkpoint.json").exists());
    Ok(())
}

#[test]
fn test_connection_reports_reply() -> anyhow::Result<()> {
    let stub = OpenAiStub::spawn(StubBehavior::Translate);
    cli()
        .args([
            "test-connection",
            "--api-key",
            "sk-test",
            "--base-url",
            &stub.base_url,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
    assert_eq!(stub.request_count(), 1);
    Ok(())
}

#[test]
fn missing_api_key_fails_before_any_request() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let input = source_fixture(temp.path())?;
    let stub = OpenAiStub::spawn(StubBehavior::Translate);

    cli()
        .args([
            "translate",
            input.to_str().unwrap(),
            "--base-url",
            &stub.base_url,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key is required"));
    assert_eq!(stub.request_count(), 0);
    Ok(())
}
