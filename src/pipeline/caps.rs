//! Capabilities: the formats a stage can produce or consume, and the
//! fixed format a link carries once negotiated.
//!
//! Caps are written in a small text syntax:
//!
//! ```text
//! video/x-raw, format={ NV12, I420 }, width=[ 1, 8192 ], height=360, framerate=15/1
//! ```
//!
//! Several structures are separated by `;`, and `ANY` stands for
//! unconstrained caps. Keys other than `format`, `width`, `height` and
//! `framerate` are kept as plain string parameters which must match
//! exactly when both sides specify them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Media type of the data carried by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Unframed bytes straight from a socket
    ByteStream,
    /// H.264 Annex B, one access unit per buffer
    H264,
    /// Uncompressed pictures
    RawVideo,
    /// Serialized RTP packets
    Rtp,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::ByteStream => "application/octet-stream",
            MediaType::H264 => "video/x-h264",
            MediaType::RawVideo => "video/x-raw",
            MediaType::Rtp => "application/x-rtp",
        }
    }
}

impl FromStr for MediaType {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // memory features such as "video/x-raw(memory:NVMM)" are irrelevant here
        let name = s.split('(').next().unwrap_or(s).trim();
        match name {
            "application/octet-stream" => Ok(MediaType::ByteStream),
            "video/x-h264" => Ok(MediaType::H264),
            "video/x-raw" => Ok(MediaType::RawVideo),
            "application/x-rtp" => Ok(MediaType::Rtp),
            other => Err(CapsParseError::UnknownMediaType(other.to_string())),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel layout of raw video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Y plane followed by interleaved UV at quarter resolution
    Nv12,
    /// Y, U and V planes, chroma at quarter resolution
    I420,
    /// Packed 8-bit RGBA
    Rgba,
}

impl PixelLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelLayout::Nv12 => "NV12",
            PixelLayout::I420 => "I420",
            PixelLayout::Rgba => "RGBA",
        }
    }

    /// Size in bytes of one picture in this layout
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelLayout::Nv12 | PixelLayout::I420 => w * h + 2 * w.div_ceil(2) * h.div_ceil(2),
            PixelLayout::Rgba => w * h * 4,
        }
    }
}

impl FromStr for PixelLayout {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NV12" => Ok(PixelLayout::Nv12),
            "I420" => Ok(PixelLayout::I420),
            "RGBA" => Ok(PixelLayout::Rgba),
            other => Err(CapsParseError::UnknownLayout(other.to_string())),
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame rate as a rational number
#[derive(Debug, Clone, Copy)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Duration of one frame in microseconds, 0 for a zero rate
    pub fn frame_duration_micros(&self) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (self.den as i64 * 1_000_000) / self.num as i64
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Fraction {}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num as u64 * other.den as u64).cmp(&(other.num as u64 * self.den as u64))
    }
}

impl FromStr for Fraction {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CapsParseError::InvalidValue(s.to_string());
        let (num, den) = s.trim().split_once('/').ok_or_else(invalid)?;
        let num = num.trim().parse().map_err(|_| invalid())?;
        let den: u32 = den.trim().parse().map_err(|_| invalid())?;
        if den == 0 {
            return Err(invalid());
        }
        Ok(Fraction::new(num, den))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Closed range of values, a single value when `min == max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: Ord + Copy> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn fixed(value: T) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(Self { min, max })
    }
}

impl<T: fmt::Display + PartialEq> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "[ {}, {} ]", self.min, self.max)
        }
    }
}

pub type IntRange = Range<u32>;
pub type FractionRange = Range<Fraction>;

/// A fixed format carried by a link
#[derive(Debug, Clone, PartialEq)]
pub struct Format {
    pub media: MediaType,
    pub layout: Option<PixelLayout>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Fraction>,
    pub params: BTreeMap<String, String>,
}

impl Format {
    pub fn new(media: MediaType) -> Self {
        Self {
            media,
            layout: None,
            width: None,
            height: None,
            framerate: None,
            params: BTreeMap::new(),
        }
    }

    /// Fully described raw video format
    pub fn raw(layout: PixelLayout, width: u32, height: u32, framerate: Fraction) -> Self {
        Self {
            layout: Some(layout),
            width: Some(width),
            height: Some(height),
            framerate: Some(framerate),
            ..Self::new(MediaType::RawVideo)
        }
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Byte size of one picture, if the format is raw and fully sized
    pub fn frame_size(&self) -> Option<usize> {
        Some(self.layout?.frame_size(self.width?, self.height?))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media)?;
        if let Some(layout) = self.layout {
            write!(f, ", format={}", layout)?;
        }
        if let Some(width) = self.width {
            write!(f, ", width={}", width)?;
        }
        if let Some(height) = self.height {
            write!(f, ", height={}", height)?;
        }
        if let Some(framerate) = self.framerate {
            write!(f, ", framerate={}", framerate)?;
        }
        for (key, value) in &self.params {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for Format {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps: Caps = s.parse()?;
        caps.to_fixed().ok_or_else(|| CapsParseError::NotFixed(s.to_string()))
    }
}

/// One caps structure: a media type plus optional constraints
#[derive(Debug, Clone, PartialEq)]
pub struct Caps {
    pub media: MediaType,
    /// Acceptable layouts in order of preference, `None` for any
    pub layouts: Option<Vec<PixelLayout>>,
    pub width: Option<IntRange>,
    pub height: Option<IntRange>,
    pub framerate: Option<FractionRange>,
    pub params: BTreeMap<String, String>,
}

impl Caps {
    pub fn new(media: MediaType) -> Self {
        Self {
            media,
            layouts: None,
            width: None,
            height: None,
            framerate: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_layouts(mut self, layouts: &[PixelLayout]) -> Self {
        self.layouts = Some(layouts.to_vec());
        self
    }

    pub fn with_size(mut self, width: IntRange, height: IntRange) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_framerate(mut self, framerate: FractionRange) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Caps accepting exactly this format
    pub fn from_format(format: &Format) -> Self {
        Self {
            media: format.media,
            layouts: format.layout.map(|l| vec![l]),
            width: format.width.map(IntRange::fixed),
            height: format.height.map(IntRange::fixed),
            framerate: format.framerate.map(FractionRange::fixed),
            params: format.params.clone(),
        }
    }

    /// Common subset of two structures, keeping this side's layout order
    pub fn intersect(&self, other: &Caps) -> Option<Caps> {
        if self.media != other.media {
            return None;
        }

        let layouts = match (&self.layouts, &other.layouts) {
            (Some(ours), Some(theirs)) => {
                let common: Vec<_> = ours.iter().copied().filter(|l| theirs.contains(l)).collect();
                if common.is_empty() {
                    return None;
                }
                Some(common)
            }
            (Some(ours), None) => Some(ours.clone()),
            (None, theirs) => theirs.clone(),
        };

        let mut params = self.params.clone();
        for (key, value) in &other.params {
            match params.get(key) {
                Some(ours) if ours != value => return None,
                Some(_) => {}
                None => {
                    params.insert(key.clone(), value.clone());
                }
            }
        }

        Some(Caps {
            media: self.media,
            layouts,
            width: intersect_opt(self.width, other.width)?,
            height: intersect_opt(self.height, other.height)?,
            framerate: intersect_opt(self.framerate, other.framerate)?,
            params,
        })
    }

    /// Pick a single format: first layout, lowest value of each range
    pub fn fixate(&self) -> Format {
        Format {
            media: self.media,
            layout: self.layouts.as_ref().and_then(|l| l.first().copied()),
            width: self.width.map(|r| r.min),
            height: self.height.map(|r| r.min),
            framerate: self.framerate.map(|r| r.min),
            params: self.params.clone(),
        }
    }

    /// The format this structure describes if it is already fixed
    pub fn to_fixed(&self) -> Option<Format> {
        let single_layout = self.layouts.as_ref().is_none_or(|l| l.len() == 1);
        let fixed = single_layout
            && self.width.is_none_or(|r| r.min == r.max)
            && self.height.is_none_or(|r| r.min == r.max)
            && self.framerate.is_none_or(|r| r.min == r.max);
        fixed.then(|| self.fixate())
    }

    /// Whether `format` lies within this structure
    ///
    /// Fields left unset in `format` are treated as unconstrained.
    pub fn accepts(&self, format: &Format) -> bool {
        if self.media != format.media {
            return false;
        }
        if let (Some(layouts), Some(layout)) = (&self.layouts, format.layout) {
            if !layouts.contains(&layout) {
                return false;
            }
        }
        if let (Some(range), Some(width)) = (self.width, format.width) {
            if !range.contains(width) {
                return false;
            }
        }
        if let (Some(range), Some(height)) = (self.height, format.height) {
            if !range.contains(height) {
                return false;
            }
        }
        if let (Some(range), Some(framerate)) = (self.framerate, format.framerate) {
            if !range.contains(framerate) {
                return false;
            }
        }
        self.params
            .iter()
            .all(|(key, value)| format.params.get(key).is_none_or(|v| v == value))
    }
}

fn intersect_opt<T: Ord + Copy>(
    a: Option<Range<T>>,
    b: Option<Range<T>>,
) -> Option<Option<Range<T>>> {
    match (a, b) {
        (Some(a), Some(b)) => a.intersect(&b).map(Some),
        (Some(r), None) | (None, Some(r)) => Some(Some(r)),
        (None, None) => Some(None),
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media)?;
        if let Some(layouts) = &self.layouts {
            if let [single] = layouts.as_slice() {
                write!(f, ", format={}", single)?;
            } else {
                let names: Vec<_> = layouts.iter().map(PixelLayout::as_str).collect();
                write!(f, ", format={{ {} }}", names.join(", "))?;
            }
        }
        if let Some(width) = self.width {
            write!(f, ", width={}", width)?;
        }
        if let Some(height) = self.height {
            write!(f, ", height={}", height)?;
        }
        if let Some(framerate) = self.framerate {
            write!(f, ", framerate={}", framerate)?;
        }
        for (key, value) in &self.params {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for Caps {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = split_top_level(s, ',').into_iter();
        let media = fields
            .next()
            .filter(|m| !m.trim().is_empty())
            .ok_or(CapsParseError::Empty)?
            .parse()?;
        let mut caps = Caps::new(media);

        for field in fields {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| CapsParseError::InvalidField(field.trim().to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "format" => {
                    let layouts = match list_body(value) {
                        Some(items) => items
                            .split(',')
                            .map(str::parse)
                            .collect::<Result<Vec<PixelLayout>, _>>()?,
                        None => vec![value.parse()?],
                    };
                    caps.layouts = Some(layouts);
                }
                "width" => caps.width = Some(parse_range(value, |v| v.parse().ok())?),
                "height" => caps.height = Some(parse_range(value, |v| v.parse().ok())?),
                "framerate" => caps.framerate = Some(parse_range(value, |v| v.parse().ok())?),
                _ => {
                    caps.params.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(caps)
    }
}

fn list_body(value: &str) -> Option<&str> {
    value.strip_prefix('{')?.strip_suffix('}')
}

fn parse_range<T, F>(value: &str, parse: F) -> Result<Range<T>, CapsParseError>
where
    T: Ord + Copy,
    F: Fn(&str) -> Option<T>,
{
    let invalid = || CapsParseError::InvalidValue(value.to_string());
    match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(body) => {
            let (min, max) = body.split_once(',').ok_or_else(invalid)?;
            let min = parse(min.trim()).ok_or_else(invalid)?;
            let max = parse(max.trim()).ok_or_else(invalid)?;
            if min > max {
                return Err(invalid());
            }
            Ok(Range::new(min, max))
        }
        None => parse(value).map(Range::fixed).ok_or_else(invalid),
    }
}

/// Split on `sep` outside of `{}` and `[]`
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// An ordered set of caps structures, or `ANY`
#[derive(Debug, Clone, PartialEq)]
pub enum CapsSet {
    Any,
    Structures(Vec<Caps>),
}

impl CapsSet {
    pub fn single(caps: Caps) -> Self {
        CapsSet::Structures(vec![caps])
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CapsSet::Structures(s) if s.is_empty())
    }

    pub fn accepts(&self, format: &Format) -> bool {
        match self {
            CapsSet::Any => true,
            CapsSet::Structures(structures) => structures.iter().any(|c| c.accepts(format)),
        }
    }

    /// First non-empty pairwise intersection, walking `self` in order
    ///
    /// Two `ANY` sides meet on unconstrained bytes.
    pub fn first_intersection(&self, other: &CapsSet) -> Option<Caps> {
        match (self, other) {
            (CapsSet::Any, CapsSet::Any) => Some(Caps::new(MediaType::ByteStream)),
            (CapsSet::Any, CapsSet::Structures(s)) | (CapsSet::Structures(s), CapsSet::Any) => {
                s.first().cloned()
            }
            (CapsSet::Structures(ours), CapsSet::Structures(theirs)) => ours
                .iter()
                .find_map(|a| theirs.iter().find_map(|b| a.intersect(b))),
        }
    }
}

impl fmt::Display for CapsSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsSet::Any => f.write_str("ANY"),
            CapsSet::Structures(structures) if structures.is_empty() => f.write_str("EMPTY"),
            CapsSet::Structures(structures) => {
                for (i, caps) in structures.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", caps)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for CapsSet {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "ANY" {
            return Ok(CapsSet::Any);
        }
        s.split(';')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Caps>, _>>()
            .map(CapsSet::Structures)
    }
}

impl From<Caps> for CapsSet {
    fn from(caps: Caps) -> Self {
        CapsSet::single(caps)
    }
}

/// Resolve the format of a link between a producer and a consumer
pub fn negotiate(producer: &CapsSet, consumer: &CapsSet) -> Option<Format> {
    producer.first_intersection(consumer).map(|caps| caps.fixate())
}

#[derive(Debug, Error, PartialEq)]
pub enum CapsParseError {
    #[error("empty caps")]
    Empty,
    #[error("unknown media type '{0}'")]
    UnknownMediaType(String),
    #[error("unknown pixel format '{0}'")]
    UnknownLayout(String),
    #[error("malformed caps field '{0}'")]
    InvalidField(String),
    #[error("invalid caps value '{0}'")]
    InvalidValue(String),
    #[error("caps '{0}' are not fixed")]
    NotFixed(String),
}
