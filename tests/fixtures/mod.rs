//! Source images used across integration tests
#![allow(dead_code)]

use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// A catalog entry with its expected artifact location
#[derive(Debug, Clone)]
pub struct SourceImageFixture {
    pub image_id: &'static str,
    pub filename: &'static str,
    pub owner_id: Option<&'static str>,
    pub expected_uri: &'static str,
    pub description: &'static str,
}

pub const SOURCE_IMAGES: &[SourceImageFixture] = &[
    SourceImageFixture {
        image_id: "42",
        filename: "42.png",
        owner_id: Some("editor-1"),
        expected_uri: "splats/42.sog",
        description: "Numeric id, owned upload",
    },
    SourceImageFixture {
        image_id: "hero_banner-7",
        filename: "hero_banner-7.png",
        owner_id: None,
        expected_uri: "splats/hero_banner-7.sog",
        description: "Slug-style id, no owner",
    },
    SourceImageFixture {
        image_id: "1001",
        filename: "1001.png",
        owner_id: Some("editor-2"),
        expected_uri: "splats/1001.sog",
        description: "Second numeric id for concurrent runs",
    },
];

pub fn fixture(image_id: &str) -> &'static SourceImageFixture {
    SOURCE_IMAGES
        .iter()
        .find(|f| f.image_id == image_id)
        .unwrap_or_else(|| panic!("no fixture for {image_id}"))
}

/// A small gradient PNG, enough for format sniffing and upload.
pub fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 32) as u8, (y * 32) as u8, 128]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

/// Bytes the mock generation service hands back as the splat.
pub const SPLAT_BYTES: &[u8] = b"SOG\x01fake-gaussian-splat-payload";
