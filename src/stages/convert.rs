//! Pixel layout conversion and scaling
//!
//! YUV is BT.601 limited range. Scaling is nearest-neighbour, plane by
//! plane, in the source layout.

use anyhow::{Result, bail};
use bytes::Bytes;

use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType, PixelLayout};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::types::Buffer;

const ALL_LAYOUTS: [PixelLayout; 3] = [PixelLayout::Rgba, PixelLayout::Nv12, PixelLayout::I420];

/// Size of one picture, checked against the data actually present
fn check_size(data: &[u8], layout: PixelLayout, width: u32, height: u32) -> Result<()> {
    let expected = layout.frame_size(width, height);
    if data.len() != expected {
        bail!(
            "{}x{} {} picture should be {} bytes, got {}",
            width,
            height,
            layout,
            expected,
            data.len()
        );
    }
    Ok(())
}

/// Scale one plane of `bpp`-byte pixels
fn scale_plane(src: &[u8], sw: usize, sh: usize, bpp: usize, dw: usize, dh: usize, dst: &mut Vec<u8>) {
    if sw == 0 || sh == 0 {
        dst.resize(dst.len() + dw * dh * bpp, 0);
        return;
    }
    for y in 0..dh {
        let sy = y * sh / dh.max(1);
        let row = &src[sy * sw * bpp..(sy + 1) * sw * bpp];
        for x in 0..dw {
            let sx = x * sw / dw.max(1);
            dst.extend_from_slice(&row[sx * bpp..(sx + 1) * bpp]);
        }
    }
}

/// Resize a picture without changing its layout
pub fn scale(data: &[u8], layout: PixelLayout, sw: u32, sh: u32, dw: u32, dh: u32) -> Result<Vec<u8>> {
    check_size(data, layout, sw, sh)?;
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    let mut out = Vec::with_capacity(layout.frame_size(dw as u32, dh as u32));

    match layout {
        PixelLayout::Rgba => scale_plane(data, sw, sh, 4, dw, dh, &mut out),
        PixelLayout::I420 => {
            let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
            let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
            let (y, chroma) = data.split_at(sw * sh);
            let (u, v) = chroma.split_at(scw * sch);
            scale_plane(y, sw, sh, 1, dw, dh, &mut out);
            scale_plane(u, scw, sch, 1, dcw, dch, &mut out);
            scale_plane(v, scw, sch, 1, dcw, dch, &mut out);
        }
        PixelLayout::Nv12 => {
            let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
            let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
            let (y, uv) = data.split_at(sw * sh);
            scale_plane(y, sw, sh, 1, dw, dh, &mut out);
            scale_plane(uv, scw, sch, 2, dcw, dch, &mut out);
        }
    }
    Ok(out)
}

/// Planar 4:2:0 picture used as the pivot between layouts
struct Yuv420 {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    (r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8)
}

fn to_yuv420(data: &[u8], layout: PixelLayout, w: usize, h: usize) -> Yuv420 {
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    match layout {
        PixelLayout::I420 => {
            let (y, chroma) = data.split_at(w * h);
            let (u, v) = chroma.split_at(cw * ch);
            Yuv420 {
                y: y.to_vec(),
                u: u.to_vec(),
                v: v.to_vec(),
            }
        }
        PixelLayout::Nv12 => {
            let (y, uv) = data.split_at(w * h);
            Yuv420 {
                y: y.to_vec(),
                u: uv.iter().step_by(2).copied().collect(),
                v: uv.iter().skip(1).step_by(2).copied().collect(),
            }
        }
        PixelLayout::Rgba => {
            let mut y_plane = Vec::with_capacity(w * h);
            let mut u_sum = vec![0u32; cw * ch];
            let mut v_sum = vec![0u32; cw * ch];
            let mut count = vec![0u32; cw * ch];
            for row in 0..h {
                for col in 0..w {
                    let px = &data[(row * w + col) * 4..(row * w + col) * 4 + 4];
                    let (y, u, v) = rgb_to_yuv(px[0], px[1], px[2]);
                    y_plane.push(y);
                    let c = (row / 2) * cw + col / 2;
                    u_sum[c] += u as u32;
                    v_sum[c] += v as u32;
                    count[c] += 1;
                }
            }
            let average = |sum: Vec<u32>| -> Vec<u8> {
                sum.iter()
                    .zip(&count)
                    .map(|(s, n)| (s / (*n).max(1)) as u8)
                    .collect()
            };
            Yuv420 {
                y: y_plane,
                u: average(u_sum),
                v: average(v_sum),
            }
        }
    }
}

fn from_yuv420(yuv: Yuv420, layout: PixelLayout, w: usize, h: usize) -> Vec<u8> {
    let cw = w.div_ceil(2);
    match layout {
        PixelLayout::I420 => {
            let mut out = yuv.y;
            out.extend_from_slice(&yuv.u);
            out.extend_from_slice(&yuv.v);
            out
        }
        PixelLayout::Nv12 => {
            let mut out = yuv.y;
            for (u, v) in yuv.u.iter().zip(&yuv.v) {
                out.push(*u);
                out.push(*v);
            }
            out
        }
        PixelLayout::Rgba => {
            let mut out = Vec::with_capacity(w * h * 4);
            for row in 0..h {
                for col in 0..w {
                    let c = (row / 2) * cw + col / 2;
                    let (r, g, b) = yuv_to_rgb(yuv.y[row * w + col], yuv.u[c], yuv.v[c]);
                    out.extend_from_slice(&[r, g, b, 255]);
                }
            }
            out
        }
    }
}

/// Change the layout of a picture, keeping its size
pub fn convert(data: &[u8], from: PixelLayout, to: PixelLayout, width: u32, height: u32) -> Result<Vec<u8>> {
    check_size(data, from, width, height)?;
    if from == to {
        return Ok(data.to_vec());
    }
    let (w, h) = (width as usize, height as usize);
    Ok(from_yuv420(to_yuv420(data, from, w, h), to, w, h))
}

/// Bring a picture to the given raw format, scaling and converting as needed
///
/// Fields `target` leaves open are taken from `source`.
pub fn conform(data: &Bytes, source: &Format, target: &Format) -> Result<(Bytes, Format)> {
    let (Some(layout), Some(width), Some(height)) = (source.layout, source.width, source.height) else {
        bail!("cannot convert from an incomplete format [{}]", source);
    };
    let to_layout = target.layout.unwrap_or(layout);
    let to_width = target.width.unwrap_or(width);
    let to_height = target.height.unwrap_or(height);

    let mut format = source.clone();
    format.layout = Some(to_layout);
    format.width = Some(to_width);
    format.height = Some(to_height);
    if target.framerate.is_some() {
        format.framerate = target.framerate;
    }

    if (to_layout, to_width, to_height) == (layout, width, height) {
        check_size(data, layout, width, height)?;
        return Ok((data.clone(), format));
    }

    let scaled = if (to_width, to_height) != (width, height) {
        scale(data, layout, width, height, to_width, to_height)?
    } else {
        data.to_vec()
    };
    let converted = convert(&scaled, layout, to_layout, to_width, to_height)?;
    Ok((Bytes::from(converted), format))
}

/// Layout converter stage
///
/// Offers the input layout first so that it passes through untouched
/// whenever downstream accepts it.
pub struct Converter {
    output: Option<Format>,
}

impl Converter {
    pub fn new() -> Self {
        Self { output: None }
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for Converter {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::RawVideo).with_layouts(&ALL_LAYOUTS).into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        let Some(input) = input else {
            return self.sink_caps();
        };
        let mut layouts: Vec<PixelLayout> = input.layout.into_iter().collect();
        layouts.extend(ALL_LAYOUTS.iter().filter(|l| Some(**l) != input.layout));

        let mut caps = Caps::from_format(input);
        caps.layouts = Some(layouts);
        caps.into()
    }

    fn configure(&mut self, _input: &Format, output: &Format) -> Result<()> {
        self.output = Some(output.clone());
        Ok(())
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(target) = &self.output else {
            bail!("converter used before negotiation");
        };
        match buffer {
            Buffer::Frame(mut frame) => {
                let (data, format) = conform(&frame.data, &frame.format, target)?;
                frame.data = data;
                frame.format = format;
                out.push(Buffer::Frame(frame));
            }
            Buffer::Batch(mut batch) => {
                for frame in &mut batch.frames {
                    let (data, format) = conform(&frame.data, &frame.format, target)?;
                    frame.data = data;
                    frame.format = format;
                }
                out.push(Buffer::Batch(batch));
            }
            Buffer::Packet(_) => bail!("converter cannot handle packets"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::{Fraction, negotiate};

    fn solid_rgba(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        (0..w * h).flat_map(|_| [rgb[0], rgb[1], rgb[2], 255]).collect()
    }

    #[test]
    fn test_output_sizes() {
        let rgba = solid_rgba(6, 4, [10, 20, 30]);
        for layout in [PixelLayout::I420, PixelLayout::Nv12] {
            let yuv = convert(&rgba, PixelLayout::Rgba, layout, 6, 4).unwrap();
            assert_eq!(yuv.len(), layout.frame_size(6, 4));
            let back = convert(&yuv, layout, PixelLayout::Rgba, 6, 4).unwrap();
            assert_eq!(back.len(), rgba.len());
        }
        // odd dimensions round chroma up
        let odd = vec![0u8; PixelLayout::I420.frame_size(5, 3)];
        assert_eq!(convert(&odd, PixelLayout::I420, PixelLayout::Nv12, 5, 3).unwrap().len(), 15 + 2 * 3 * 2);
    }

    #[test]
    fn test_white_and_black_survive_conversion() {
        for (rgb, tolerance) in [([255u8, 255, 255], 3), ([0u8, 0, 0], 3)] {
            let rgba = solid_rgba(4, 4, rgb);
            let i420 = convert(&rgba, PixelLayout::Rgba, PixelLayout::I420, 4, 4).unwrap();
            let back = convert(&i420, PixelLayout::I420, PixelLayout::Rgba, 4, 4).unwrap();
            for px in back.chunks(4) {
                for c in 0..3 {
                    assert!((px[c] as i32 - rgb[c] as i32).abs() <= tolerance, "{:?}", px);
                }
                assert_eq!(px[3], 255);
            }
        }
    }

    #[test]
    fn test_nv12_i420_roundtrip_is_exact() {
        let i420: Vec<u8> = (0..PixelLayout::I420.frame_size(4, 2)).map(|i| i as u8).collect();
        let nv12 = convert(&i420, PixelLayout::I420, PixelLayout::Nv12, 4, 2).unwrap();
        assert_eq!(&nv12[8..], &[8, 10, 9, 11]);
        let back = convert(&nv12, PixelLayout::Nv12, PixelLayout::I420, 4, 2).unwrap();
        assert_eq!(back, i420);
    }

    #[test]
    fn test_scale_nearest() {
        let rgba: Vec<u8> = (0..4u8).flat_map(|i| [i, i, i, 255]).collect();
        let scaled = scale(&rgba, PixelLayout::Rgba, 2, 2, 4, 4).unwrap();
        assert_eq!(scaled.len(), 64);
        // top-left quadrant comes from pixel 0, bottom-right from pixel 3
        assert_eq!(&scaled[0..4], &[0, 0, 0, 255]);
        assert_eq!(&scaled[60..64], &[3, 3, 3, 255]);

        let i420 = vec![0u8; PixelLayout::I420.frame_size(640, 360)];
        let down = scale(&i420, PixelLayout::I420, 640, 360, 160, 96).unwrap();
        assert_eq!(down.len(), PixelLayout::I420.frame_size(160, 96));
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(convert(&[0u8; 10], PixelLayout::I420, PixelLayout::Nv12, 4, 4).is_err());
    }

    #[test]
    fn test_conform_scales_and_converts() {
        let source = Format::raw(PixelLayout::Rgba, 4, 4, Fraction::new(15, 1));
        let target = Format::raw(PixelLayout::I420, 2, 2, Fraction::new(15, 1));
        let data = Bytes::from(solid_rgba(4, 4, [255, 0, 0]));
        let (out, format) = conform(&data, &source, &target).unwrap();
        assert_eq!(format, target);
        assert_eq!(out.len(), PixelLayout::I420.frame_size(2, 2));

        let (same, _) = conform(&data, &source, &source).unwrap();
        assert_eq!(same, data);
    }

    #[test]
    fn test_converter_prefers_input_layout() {
        let converter = Converter::new();
        let input = Format::raw(PixelLayout::Nv12, 640, 360, Fraction::new(15, 1));
        let src = converter.src_caps(Some(&input));

        let any_raw: CapsSet = "video/x-raw".parse().unwrap();
        assert_eq!(negotiate(&src, &any_raw), Some(input.clone()));

        let rgba_only: CapsSet = "video/x-raw, format=RGBA".parse().unwrap();
        let format = negotiate(&src, &rgba_only).unwrap();
        assert_eq!(format.layout, Some(PixelLayout::Rgba));
        assert_eq!(format.width, Some(640));
    }
}
