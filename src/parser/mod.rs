pub mod error;
pub mod extract;
pub mod frames;
pub mod probe;
pub mod push;
pub mod scripts;

use tracing::debug;

use crate::db::{RecordRow, ScrapedPage};
pub use error::DecodeError;
pub use extract::{extract_business_record, BusinessRecord, Lookup};
pub use frames::{decode_frames, Frame};

/// HTML → script blocks → combined buffer → frames.
/// A page without the marker script decodes to no frames.
pub fn decode_page(html: &str, marker: &str) -> Result<Vec<Frame>, DecodeError> {
    let scripts = scripts::extract_scripts(html);
    match push::combined_buffer(&scripts, marker)? {
        Some(buffer) => decode_frames(&buffer),
        None => Ok(Vec::new()),
    }
}

/// Decode one stored page into its business record. A decode failure is kept on the
/// row and yields an empty record; it never affects other pages.
pub fn process_page(page: &ScrapedPage, marker: &str) -> RecordRow {
    let (record, frame_count, decode_error) = match decode_page(&page.html, marker) {
        Ok(frames) => (extract_business_record(&frames), frames.len(), None),
        Err(e) => {
            debug!("Failed to decode page for {}: {}", page.slug, e);
            (BusinessRecord::default(), 0, Some(e.to_string()))
        }
    };

    RecordRow {
        page_data_id: page.page_data_id,
        slug: page.slug.clone(),
        record,
        frame_count,
        decode_error,
    }
}
