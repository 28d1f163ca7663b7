//! Shared fixtures: partition defaults, key naming, and tiny encodable
//! images for the in-memory object store.

use std::io::Cursor;

use chrono::NaiveDate;
use image::{ImageFormat, RgbImage};

use bib_batch::models::partition::Partition;

pub const CUSTOMER: &str = "acme-events";
pub const ROOT_PREFIX: &str = "images";

pub fn cutoff_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

pub fn partition() -> Partition {
    Partition::new(cutoff_date(), "test", None)
}

/// Key following the `{eid}_{cid}_{photonum}_tn_*` naming convention, placed
/// under the partition's listing prefix.
pub fn image_key(partition: &Partition, eid: i64, cid: i64, photonum: i64) -> String {
    format!(
        "{}/{}_{}_{}_tn_1.jpg",
        partition.listing_prefix(ROOT_PREFIX),
        eid,
        cid,
        photonum
    )
}

/// Small solid-color JPEG, large enough to survive the minimum crop size.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([120, 130, 140]));
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    buf.into_inner()
}
