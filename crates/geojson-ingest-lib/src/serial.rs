//! Binary encoding of the intermediate streams
//!
//! Every segment owns three append-only streams:
//!
//! - **geometry**: serialized [`FeatureRecord`]s, variable length
//! - **metadata**: pool reference pairs of features whose attributes are stored out of line
//! - **index**: one fixed-size [`IndexEntry`] per record, used for spatial sorting
//!
//! Integers are LEB128 varints; signed values are zig-zag encoded first. Geometry
//! coordinates are written as deltas from the previous point, starting at the segment's
//! downscaled origin.

use crate::feature::{FeatureRecord, MetadataPlacement};
use crate::geometry::{DrawOp, FeatureType, Op};
use crate::pool::PoolRef;
use crate::{IngestError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::io::{self, Read, Write};

/// Op byte terminating the geometry of a record
const END_OF_GEOMETRY: u8 = 0;

/// Bits of the flags word below the layer number
const LAYER_SHIFT: u32 = 6;
const FLAG_SEQ: u64 = 1 << 5;
const FLAG_INDEX: u64 = 1 << 4;
const FLAG_EXTENT: u64 = 1 << 3;
const FLAG_ID: u64 = 1 << 2;
const FLAG_MINZOOM: u64 = 1 << 1;
const FLAG_MAXZOOM: u64 = 1;

#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn write_uvarint<W: Write + ?Sized>(w: &mut W, mut v: u64) -> io::Result<()> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n])
}

#[inline]
pub fn write_varint<W: Write + ?Sized>(w: &mut W, v: i64) -> io::Result<()> {
    write_uvarint(w, zigzag(v))
}

pub fn read_uvarint<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = r.read_u8()?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(IngestError::CorruptStream("varint longer than 64 bits".to_string()))
}

#[inline]
pub fn read_varint<R: Read + ?Sized>(r: &mut R) -> Result<i64> {
    read_uvarint(r).map(unzigzag)
}

/// Writer that keeps track of how many bytes went through it
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Current offset, i.e. the number of bytes written so far
    pub fn position(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fixed-size entry of the index stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the record in its segment's geometry stream
    pub start: u64,
    /// One past the last byte of the record
    pub end: u64,
    /// Spatial sort key
    pub key: u64,
    pub seq: i64,
    pub segment: u32,
    pub feature_type: FeatureType,
}

impl IndexEntry {
    /// Encoded size in bytes
    pub const SIZE: usize = 40;

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.start)?;
        w.write_u64::<LittleEndian>(self.end)?;
        w.write_u64::<LittleEndian>(self.key)?;
        w.write_i64::<LittleEndian>(self.seq)?;
        w.write_u32::<LittleEndian>(self.segment)?;
        w.write_u8(self.feature_type.code())?;
        w.write_all(&[0u8; 3])
    }

    /// Read one entry, or `None` at a clean end of stream
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE];
        let mut filled = 0;
        while filled < Self::SIZE {
            match r.read(&mut buf[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(IngestError::CorruptStream(format!(
                        "truncated index entry ({filled} of {} bytes)",
                        Self::SIZE
                    )));
                }
                n => filled += n,
            }
        }

        let mut r = &buf[..];
        let start = r.read_u64::<LittleEndian>()?;
        let end = r.read_u64::<LittleEndian>()?;
        let key = r.read_u64::<LittleEndian>()?;
        let seq = r.read_i64::<LittleEndian>()?;
        let segment = r.read_u32::<LittleEndian>()?;
        let code = r.read_u8()?;
        let feature_type = FeatureType::from_code(code)
            .ok_or_else(|| IngestError::CorruptStream(format!("unknown feature type {code}")))?;

        Ok(Some(Self {
            start,
            end,
            key,
            seq,
            segment,
            feature_type,
        }))
    }

    /// Decode a whole index stream
    pub fn read_all(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut entries = Vec::with_capacity(bytes.len() / Self::SIZE);
        while let Some(entry) = Self::read_from(&mut bytes)? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// The three output streams of one segment
#[derive(Debug)]
pub struct SegmentOutput<W> {
    pub geometry: CountingWriter<W>,
    pub metadata: CountingWriter<W>,
    pub index: CountingWriter<W>,
}

impl SegmentOutput<Vec<u8>> {
    /// Streams backed by in-memory buffers
    pub fn in_memory() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }
}

impl<W: Write> SegmentOutput<W> {
    pub fn new(geometry: W, metadata: W, index: W) -> Self {
        Self {
            geometry: CountingWriter::new(geometry),
            metadata: CountingWriter::new(metadata),
            index: CountingWriter::new(index),
        }
    }

    /// Append attribute reference pairs to the metadata stream, returning their offset
    pub fn write_metadata(&mut self, pairs: &[(PoolRef, PoolRef)]) -> Result<u64> {
        let offset = self.metadata.position();
        for (key, value) in pairs {
            write_uvarint(&mut self.metadata, key.offset())?;
            write_uvarint(&mut self.metadata, value.offset())?;
        }
        Ok(offset)
    }

    /// Serialize a record into the geometry stream, returning its byte range
    ///
    /// `origin` is the segment origin in downscaled units.
    pub fn write_record(&mut self, record: &FeatureRecord, origin: (i64, i64)) -> Result<(u64, u64)> {
        let start = self.geometry.position();
        encode_record(&mut self.geometry, record, origin)?;
        Ok((start, self.geometry.position()))
    }

    pub fn write_index(&mut self, entry: &IndexEntry) -> Result<()> {
        entry.write_to(&mut self.index)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.geometry.flush()?;
        self.metadata.flush()?;
        self.index.flush()?;
        Ok(())
    }

    /// Unwrap the streams as `(geometry, metadata, index)`
    pub fn into_inner(self) -> (W, W, W) {
        (
            self.geometry.into_inner(),
            self.metadata.into_inner(),
            self.index.into_inner(),
        )
    }
}

fn encode_record<W: Write + ?Sized>(w: &mut W, record: &FeatureRecord, origin: (i64, i64)) -> Result<()> {
    w.write_u8(record.feature_type.code())?;

    let mut flags = (record.layer as u64) << LAYER_SHIFT;
    if record.seq != 0 {
        flags |= FLAG_SEQ;
    }
    if record.index != 0 {
        flags |= FLAG_INDEX;
    }
    if record.extent != 0 {
        flags |= FLAG_EXTENT;
    }
    if record.id.is_some() {
        flags |= FLAG_ID;
    }
    if record.minzoom.is_some() {
        flags |= FLAG_MINZOOM;
    }
    if record.maxzoom.is_some() {
        flags |= FLAG_MAXZOOM;
    }
    write_uvarint(w, flags)?;

    if record.seq != 0 {
        write_varint(w, record.seq)?;
    }
    if let Some(minzoom) = record.minzoom {
        write_varint(w, i64::from(minzoom))?;
    }
    if let Some(maxzoom) = record.maxzoom {
        write_varint(w, i64::from(maxzoom))?;
    }
    if let Some(id) = record.id {
        write_uvarint(w, id)?;
    }

    write_uvarint(w, u64::from(record.segment))?;

    let (mut px, mut py) = origin;
    for d in &record.geometry {
        w.write_u8(d.op.code())?;
        if d.is_point() {
            write_varint(w, d.x - px)?;
            write_varint(w, d.y - py)?;
            px = d.x;
            py = d.y;
        }
    }
    w.write_u8(END_OF_GEOMETRY)?;

    if record.index != 0 {
        write_uvarint(w, record.index)?;
    }
    if record.extent != 0 {
        write_varint(w, record.extent)?;
    }

    match &record.metadata {
        MetadataPlacement::Inline(pairs) => {
            write_uvarint(w, pairs.len() as u64)?;
            if !pairs.is_empty() {
                write_varint(w, -1)?;
                for (key, value) in pairs {
                    write_uvarint(w, key.offset())?;
                    write_uvarint(w, value.offset())?;
                }
            }
        }
        MetadataPlacement::External { offset, count } => {
            write_uvarint(w, *count as u64)?;
            if *count != 0 {
                write_varint(w, *offset as i64)?;
            }
        }
    }

    Ok(())
}

/// Decode one record from the front of `r`
///
/// `origin` must be the same downscaled segment origin the record was written with.
pub fn read_record<R: Read + ?Sized>(r: &mut R, origin: (i64, i64)) -> Result<FeatureRecord> {
    let code = r.read_u8()?;
    let feature_type = FeatureType::from_code(code)
        .ok_or_else(|| IngestError::CorruptStream(format!("unknown feature type {code}")))?;

    let flags = read_uvarint(r)?;
    let seq = if flags & FLAG_SEQ != 0 { read_varint(r)? } else { 0 };
    let minzoom = if flags & FLAG_MINZOOM != 0 {
        Some(read_varint(r)? as i32)
    } else {
        None
    };
    let maxzoom = if flags & FLAG_MAXZOOM != 0 {
        Some(read_varint(r)? as i32)
    } else {
        None
    };
    let id = if flags & FLAG_ID != 0 {
        Some(read_uvarint(r)?)
    } else {
        None
    };
    let segment = read_uvarint(r)? as u32;

    let mut geometry = Vec::new();
    let (mut px, mut py) = origin;
    loop {
        let code = r.read_u8()?;
        if code == END_OF_GEOMETRY {
            break;
        }
        let op = Op::from_code(code)
            .ok_or_else(|| IngestError::CorruptStream(format!("unknown drawing op {code}")))?;
        if op == Op::ClosePath {
            geometry.push(DrawOp::close_path());
        } else {
            px += read_varint(r)?;
            py += read_varint(r)?;
            geometry.push(DrawOp::new(op, px, py));
        }
    }

    let index = if flags & FLAG_INDEX != 0 { read_uvarint(r)? } else { 0 };
    let extent = if flags & FLAG_EXTENT != 0 { read_varint(r)? } else { 0 };

    let count = read_uvarint(r)? as usize;
    let metadata = if count == 0 {
        MetadataPlacement::Inline(SmallVec::new())
    } else {
        let metapos = read_varint(r)?;
        if metapos < 0 {
            let mut pairs = SmallVec::with_capacity(count);
            for _ in 0..count {
                let key = PoolRef::new(read_uvarint(r)?);
                let value = PoolRef::new(read_uvarint(r)?);
                pairs.push((key, value));
            }
            MetadataPlacement::Inline(pairs)
        } else {
            MetadataPlacement::External {
                offset: metapos as u64,
                count,
            }
        }
    };

    Ok(FeatureRecord {
        feature_type,
        layer: (flags >> LAYER_SHIFT) as usize,
        seq,
        id,
        minzoom,
        maxzoom,
        segment,
        geometry,
        index,
        extent,
        metadata,
    })
}

/// Read `count` reference pairs stored at `offset` of a metadata stream
pub fn read_metadata(stream: &[u8], offset: u64, count: usize) -> Result<Vec<(PoolRef, PoolRef)>> {
    let mut r = stream.get(offset as usize..).ok_or_else(|| {
        IngestError::CorruptStream(format!("metadata offset {offset} past end of stream"))
    })?;

    (0..count)
        .map(|_| {
            let key = PoolRef::new(read_uvarint(&mut r)?);
            let value = PoolRef::new(read_uvarint(&mut r)?);
            Ok((key, value))
        })
        .collect()
}
