//! GeoTIFF plumbing shared by the in-memory and windowed readers.
//!
//! Time steps are either separate pages (one band per IFD) or the samples of a
//! pixel-interleaved single page, as GDAL writes multi-band files. The time
//! axis comes from the GDAL_METADATA tag that `gdal_translate` carries over
//! from netCDF sources (`NETCDF_DIM_time` per band plus `time#units`).

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::pixel::GeoTransform;
use crate::time::TimeAxis;

pub(crate) const MODEL_PIXEL_SCALE: u16 = 33550;
pub(crate) const MODEL_TIEPOINT: u16 = 33922;
pub(crate) const MODEL_TRANSFORMATION: u16 = 34264;
pub(crate) const GDAL_METADATA: u16 = 42112;
pub(crate) const GDAL_NODATA: u16 = 42113;

pub(crate) type TiffDecoder = Decoder<BufReader<File>>;

pub(crate) fn open(path: &Path) -> Result<TiffDecoder> {
    let file = File::open(path).map_err(|e| Error::raster(path, format!("cannot open: {e}")))?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| Error::raster(path, format!("not a readable TIFF: {e}")))?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

/// Everything about a GeoTIFF except its pixel values.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub(crate) width: usize,
    pub(crate) height: usize,
    /// Samples per pixel of the first page.
    pub(crate) samples: usize,
    /// IFD index of every full-resolution page; overviews and masks are skipped.
    pub(crate) pages: Vec<usize>,
    pub(crate) geotransform: GeoTransform,
    pub(crate) nodata: Option<f64>,
    pub(crate) time_axis: Option<TimeAxis>,
}

impl Layout {
    pub(crate) fn bands(&self) -> usize {
        if self.samples > 1 {
            self.samples
        } else {
            self.pages.len()
        }
    }

    /// IFD index and sample holding `band`.
    pub(crate) fn locate_band(&self, band: usize) -> (usize, usize) {
        if self.samples > 1 {
            (self.pages[0], band)
        } else {
            (self.pages[band], 0)
        }
    }
}

/// Walks every page once to learn the layout, leaving the decoder on the first IFD.
pub(crate) fn read_layout<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<Layout> {
    let tiff_err = |e: tiff::TiffError| Error::raster(path, e.to_string());

    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let samples = samples_per_pixel(decoder).map_err(tiff_err)?;
    let geotransform = read_geotransform(decoder, path)?;
    let nodata = read_nodata(decoder);

    let mut pages = vec![0usize];
    let mut metadata = vec![read_metadata(decoder, path)?];
    let mut ifd = 0usize;
    while decoder.more_images() {
        decoder.next_image().map_err(tiff_err)?;
        ifd += 1;
        if is_reduced_or_mask(decoder).map_err(tiff_err)? {
            continue;
        }
        let dims = decoder.dimensions().map_err(tiff_err)?;
        if dims != (width, height) {
            return Err(Error::raster(
                path,
                format!(
                    "page {} is {}x{}, first page is {}x{}",
                    ifd, dims.0, dims.1, width, height
                ),
            ));
        }
        if samples > 1 || samples_per_pixel(decoder).map_err(tiff_err)? != 1 {
            return Err(Error::raster(
                path,
                "multi-page files must hold one sample per page",
            ));
        }
        pages.push(ifd);
        metadata.push(read_metadata(decoder, path)?);
    }
    decoder.seek_to_image(0).map_err(tiff_err)?;

    let mut layout = Layout {
        width: width as usize,
        height: height as usize,
        samples,
        pages,
        geotransform,
        nodata,
        time_axis: None,
    };
    layout.time_axis = time_axis_from_metadata(&metadata, &layout, path)?;
    Ok(layout)
}

/// NewSubfileType bit 0 marks overviews, bit 2 transparency masks.
fn is_reduced_or_mask<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<bool> {
    match decoder.find_tag(Tag::NewSubfileType)? {
        Some(v) => Ok(v.into_u32()? & 0b101 != 0),
        None => Ok(false),
    }
}

fn samples_per_pixel<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<usize> {
    match decoder.find_tag(Tag::SamplesPerPixel)? {
        Some(v) => Ok(v.into_u32()? as usize),
        None => Ok(1),
    }
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE));
    let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT));

    if let (Ok(scale), Ok(tie)) = (scale, tiepoint) {
        if scale.len() >= 2 && tie.len() >= 6 {
            // tie point [i, j, k, x, y, z] pins pixel (i, j) to map (x, y)
            let (sx, sy) = (scale[0], scale[1]);
            return GeoTransform::new(tie[3] - tie[0] * sx, sx, tie[4] + tie[1] * sy, -sy)
                .map_err(|e| Error::raster(path, e.to_string()));
        }
    }

    if let Ok(m) = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TRANSFORMATION)) {
        if m.len() >= 8 {
            return GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]])
                .map_err(|e| Error::raster(path, e.to_string()));
        }
    }

    Err(Error::raster(
        path,
        "no georeferencing (ModelPixelScale/ModelTiepoint or ModelTransformation)",
    ))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse().ok())
}

fn read_metadata<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Result<Option<GdalMetadata>> {
    match decoder.get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_METADATA)) {
        Ok(xml) => GdalMetadata::parse(&xml)
            .map(Some)
            .map_err(|e| Error::raster(path, format!("bad GDAL_METADATA: {e}"))),
        Err(_) => Ok(None),
    }
}

fn time_axis_from_metadata(
    pages: &[Option<GdalMetadata>],
    layout: &Layout,
    path: &Path,
) -> Result<Option<TimeAxis>> {
    let mut units = None;
    let mut values: Vec<Option<f64>> = vec![None; layout.bands()];

    for (page, meta) in pages.iter().enumerate() {
        let Some(meta) = meta else { continue };
        if units.is_none() {
            units = meta.dataset_item("time#units").map(str::to_string);
        }
        for item in meta.items.iter().filter(|i| i.name == "NETCDF_DIM_time") {
            let band = page * layout.samples.max(1) + item.sample.unwrap_or(0);
            if let (Some(slot), Ok(v)) = (values.get_mut(band), item.value.trim().parse::<f64>()) {
                *slot = Some(v);
            }
        }
        // dataset-level list, e.g. `{1893768,1894488}`
        if values.iter().all(Option::is_none) {
            if let Some(list) = meta.dataset_item("NETCDF_DIM_time_VALUES") {
                let parsed: Vec<f64> = list
                    .trim_matches(|c| c == '{' || c == '}')
                    .split(',')
                    .filter_map(|v| v.trim().parse().ok())
                    .collect();
                if parsed.len() == values.len() {
                    values = parsed.into_iter().map(Some).collect();
                }
            }
        }
    }

    let (Some(units), Some(values)) = (units, values.into_iter().collect::<Option<Vec<f64>>>())
    else {
        return Ok(None);
    };
    TimeAxis::from_cf(&values, &units)
        .map(Some)
        .map_err(|e| Error::raster(path, e.to_string()))
}

pub(crate) fn to_f64(result: DecodingResult) -> Vec<f64> {
    match result {
        DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::F64(data) => data,
        DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f64).collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MetadataItem {
    pub(crate) name: String,
    pub(crate) sample: Option<usize>,
    pub(crate) role: Option<String>,
    pub(crate) value: String,
}

/// Contents of GDAL's `<GDALMetadata>` XML tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GdalMetadata {
    pub(crate) items: Vec<MetadataItem>,
}

impl GdalMetadata {
    pub(crate) fn parse(xml: &str) -> std::result::Result<Self, String> {
        let mut reader = Reader::from_str(xml.trim_end_matches('\0'));
        reader.trim_text(true);

        let mut items = Vec::new();
        let mut current: Option<MetadataItem> = None;
        loop {
            match reader.read_event().map_err(|e| e.to_string())? {
                Event::Start(e) if e.name().as_ref() == b"Item" => {
                    current = Some(item_from_attributes(&e)?);
                }
                Event::Empty(e) if e.name().as_ref() == b"Item" => {
                    items.push(item_from_attributes(&e)?);
                }
                Event::Text(t) => {
                    if let Some(item) = current.as_mut() {
                        item.value.push_str(&t.unescape().map_err(|e| e.to_string())?);
                    }
                }
                Event::End(e) if e.name().as_ref() == b"Item" => {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(Self { items })
    }

    /// Value of a dataset-level item (no `sample` attribute, no `role`).
    pub(crate) fn dataset_item(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.name == name && i.sample.is_none() && i.role.is_none())
            .map(|i| i.value.as_str())
    }
}

fn item_from_attributes(e: &BytesStart<'_>) -> std::result::Result<MetadataItem, String> {
    let mut item = MetadataItem::default();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        match attr.key.as_ref() {
            b"name" => item.name = value.into_owned(),
            b"sample" => {
                item.sample = Some(
                    value
                        .parse()
                        .map_err(|_| format!("bad sample index {value:?}"))?,
                )
            }
            b"role" => item.role = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(item)
}
