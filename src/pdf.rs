//! A4 export of a report's chart grid.

use printpdf::{BuiltinFont, Image, ImageTransform, Mm, PdfDocument, PdfLayerReference};

use crate::error::{AppError, AppResult};

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 15.0;
const GAP: f32 = 10.0;
const CAPTION: f32 = 7.0;
const LAYER: &str = "Graphiques";

fn pdf_err<E: std::fmt::Display>(err: E) -> AppError {
    AppError::Pdf(err.to_string())
}

/// Lays out charts two per row on A4 pages under a title.
///
/// A new page starts whenever the next row would not fit. Each chart keeps
/// its aspect ratio, with its caption just above it.
///
/// # Arguments
/// * `title` - Heading of the first page, also the document title
/// * `charts` - `(caption, png bytes)` pairs in display order
///
/// # Returns
/// * `AppResult<Vec<u8>>` - The PDF bytes. A chart that is not a decodable
///   image gives `AppError::Image`; a failure to write the document gives
///   `AppError::Pdf`.
pub fn chart_grid(title: &str, charts: &[(String, Vec<u8>)]) -> AppResult<Vec<u8>> {
    let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), LAYER);
    let font = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_err)?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_err)?;

    let cell_width = (PAGE_WIDTH - 2.0 * MARGIN - GAP) / 2.0;
    let mut current: PdfLayerReference = doc.get_page(page).get_layer(layer);
    current.use_text(title, 16.0, Mm(MARGIN), Mm(PAGE_HEIGHT - MARGIN - 5.0), &bold);
    let mut top = PAGE_HEIGHT - MARGIN - 15.0;

    for row in charts.chunks(2) {
        let decoded = row
            .iter()
            .map(|(caption, png)| image::load_from_memory(png).map(|img| (caption, img)))
            .collect::<Result<Vec<_>, _>>()?;
        let row_height = decoded
            .iter()
            .map(|(_, img)| cell_width * img.height() as f32 / img.width().max(1) as f32)
            .fold(0.0_f32, f32::max)
            + CAPTION;

        if top - row_height < MARGIN {
            let (page, layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), LAYER);
            current = doc.get_page(page).get_layer(layer);
            top = PAGE_HEIGHT - MARGIN;
        }

        for (column, (caption, img)) in decoded.into_iter().enumerate() {
            let left = MARGIN + column as f32 * (cell_width + GAP);
            current.use_text(caption.as_str(), 10.0, Mm(left), Mm(top - 4.0), &font);

            let dpi = img.width() as f32 * 25.4 / cell_width;
            let height = img.height() as f32 * 25.4 / dpi;
            Image::from_dynamic_image(&img).add_to_layer(
                current.clone(),
                ImageTransform {
                    translate_x: Some(Mm(left)),
                    translate_y: Some(Mm(top - CAPTION - height)),
                    dpi: Some(dpi),
                    ..Default::default()
                },
            );
        }
        top -= row_height + GAP;
    }

    doc.save_to_bytes().map_err(pdf_err)
}
