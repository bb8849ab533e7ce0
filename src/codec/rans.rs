//! rANS 4x8 entropy coder, CRAM 3.0 wire layout.
//!
//! ```text
//! [ order:u8 | compressed_len:u32 LE | raw_len:u32 LE ]   9-byte header
//! [ frequency table(s) ]
//! [ R0 | R1 | R2 | R3 ]                                    4 × u32 LE states
//! [ renormalisation bytes ]
//! ```
//!
//! `compressed_len` counts everything after the header.  Frequencies are
//! normalised to [`TOTFREQ`].  Four interleaved states share one byte
//! stream; the encoder runs backwards over the input and the decoder forwards.
//!
//! Frequency tables are a run-length coded list of present symbols, each
//! followed by its frequency (1 byte below 128, else 2 bytes with the high
//! bit set on the first), terminated by a zero byte.  Order 1 nests one such
//! table per context inside an outer list of contexts coded the same way.
//!
//! Order 1 splits the input into four quarters, one per state; the last
//! state also takes the `len % 4` remainder.  Each quarter starts in context
//! 0.  Inputs shorter than 4 bytes are always coded as order 0.

use super::CodecError;

const TF_SHIFT:    u32   = 12;
pub const TOTFREQ: u32   = 1 << TF_SHIFT;
const MASK:        u32   = TOTFREQ - 1;
const RANS_BYTE_L: u32   = 1 << 23;
const HEADER_LEN:  usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Zero = 0,
    One  = 1,
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Compress `data` with the requested model order.
pub fn compress(data: &[u8], order: Order) -> Result<Vec<u8>, CodecError> {
    let raw_len = u32::try_from(data.len())
        .map_err(|_| CodecError::Compression("rANS input exceeds 4 GiB".into()))?;

    let mut body = Vec::new();
    let order = if data.len() < 4 { Order::Zero } else { order };

    if !data.is_empty() {
        match order {
            Order::Zero => encode_o0(data, &mut body),
            Order::One  => encode_o1(data, &mut body),
        }
    }

    let comp_len = u32::try_from(body.len())
        .map_err(|_| CodecError::Compression("rANS output exceeds 4 GiB".into()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(order as u8);
    out.extend_from_slice(&comp_len.to_le_bytes());
    out.extend_from_slice(&raw_len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Byte sink that grows towards the front, as rANS emits in reverse.
struct ReverseSink {
    rev: Vec<u8>,
}

impl ReverseSink {
    fn new(capacity: usize) -> Self {
        Self { rev: Vec::with_capacity(capacity) }
    }

    #[inline]
    fn put(&mut self, x: &mut u32, start: u32, freq: u32) {
        let x_max = ((RANS_BYTE_L >> TF_SHIFT) << 8) * freq;
        while *x >= x_max {
            self.rev.push(*x as u8);
            *x >>= 8;
        }
        *x = ((*x / freq) << TF_SHIFT) + (*x % freq) + start;
    }

    fn flush(&mut self, x: u32) {
        self.rev.extend_from_slice(&[(x >> 24) as u8, (x >> 16) as u8, (x >> 8) as u8, x as u8]);
    }

    fn finish(mut self, out: &mut Vec<u8>) {
        self.rev.reverse();
        out.extend_from_slice(&self.rev);
    }
}

fn encode_o0(data: &[u8], out: &mut Vec<u8>) {
    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let freqs = normalise(&counts);
    let starts = cumulative(&freqs);
    write_symbol_table(out, &freqs);

    let mut sink = ReverseSink::new(data.len() + 16);
    let mut x = [RANS_BYTE_L; 4];

    let body_end = data.len() & !3;
    for k in (0..data.len() & 3).rev() {
        let s = data[body_end + k] as usize;
        sink.put(&mut x[k], starts[s], freqs[s]);
    }
    for group in data[..body_end].chunks_exact(4).rev() {
        for k in (0..4).rev() {
            let s = group[k] as usize;
            sink.put(&mut x[k], starts[s], freqs[s]);
        }
    }
    for k in (0..4).rev() {
        sink.flush(x[k]);
    }
    sink.finish(out);
}

fn encode_o1(data: &[u8], out: &mut Vec<u8>) {
    let n = data.len();
    let q = n >> 2;
    let context = |p: usize| -> usize {
        if p % q == 0 && p < 4 * q { 0 } else { data[p - 1] as usize }
    };

    let mut counts = vec![[0u32; 256]; 256];
    for p in 0..n {
        counts[context(p)][data[p] as usize] += 1;
    }
    let freqs: Vec<[u32; 256]> = counts.iter().map(normalise).collect();
    let starts: Vec<[u32; 256]> = freqs.iter().map(cumulative).collect();

    let present: [bool; 256] = std::array::from_fn(|i| counts[i].iter().any(|&c| c > 0));
    let mut rle = 0usize;
    for ctx in 0..256 {
        if !present[ctx] {
            continue;
        }
        put_rle_index(out, &present, ctx, &mut rle);
        write_symbol_table(out, &freqs[ctx]);
    }
    out.push(0);

    let mut sink = ReverseSink::new(n + 16);
    let mut x = [RANS_BYTE_L; 4];

    for p in (4 * q..n).rev() {
        let (c, s) = (context(p), data[p] as usize);
        sink.put(&mut x[3], starts[c][s], freqs[c][s]);
    }
    for t in (0..q).rev() {
        for k in (0..4).rev() {
            let p = k * q + t;
            let (c, s) = (context(p), data[p] as usize);
            sink.put(&mut x[k], starts[c][s], freqs[c][s]);
        }
    }
    for k in (0..4).rev() {
        sink.flush(x[k]);
    }
    sink.finish(out);
}

/// Scale raw counts so that present symbols sum to exactly [`TOTFREQ`], each
/// keeping a frequency of at least 1.
fn normalise(counts: &[u32; 256]) -> [u32; 256] {
    let total: u64 = counts.iter().map(|&c| c as u64).sum();
    let mut freqs = [0u32; 256];
    if total == 0 {
        return freqs;
    }

    let mut sum = 0u32;
    for (f, &c) in freqs.iter_mut().zip(counts.iter()) {
        if c > 0 {
            *f = ((c as u64 * TOTFREQ as u64) / total).max(1) as u32;
            sum += *f;
        }
    }

    // Rounding error is settled on the largest entries.
    while sum != TOTFREQ {
        let mut top = 0usize;
        for i in 1..256 {
            if freqs[i] > freqs[top] {
                top = i;
            }
        }
        if sum < TOTFREQ {
            freqs[top] += TOTFREQ - sum;
            sum = TOTFREQ;
        } else {
            let cut = (sum - TOTFREQ).min(freqs[top] - 1);
            freqs[top] -= cut;
            sum -= cut;
        }
    }
    freqs
}

fn cumulative(freqs: &[u32; 256]) -> [u32; 256] {
    let mut starts = [0u32; 256];
    let mut acc = 0u32;
    for (s, &f) in starts.iter_mut().zip(freqs.iter()) {
        *s = acc;
        acc += f;
    }
    starts
}

/// Append index `j` to a run-length coded list of present indices.
fn put_rle_index(out: &mut Vec<u8>, present: &[bool; 256], j: usize, rle: &mut usize) {
    if *rle > 0 {
        *rle -= 1;
        return;
    }
    out.push(j as u8);
    if j > 0 && present[j - 1] {
        let run = present[j + 1..].iter().take_while(|&&p| p).count();
        out.push(run as u8);
        *rle = run;
    }
}

fn write_symbol_table(out: &mut Vec<u8>, freqs: &[u32; 256]) {
    let present: [bool; 256] = std::array::from_fn(|i| freqs[i] > 0);
    let mut rle = 0usize;
    for (sym, &f) in freqs.iter().enumerate() {
        if f == 0 {
            continue;
        }
        put_rle_index(out, &present, sym, &mut rle);
        if f < 128 {
            out.push(f as u8);
        } else {
            out.push(0x80 | (f >> 8) as u8);
            out.push(f as u8);
        }
    }
    out.push(0);
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Decompress a buffer produced by [`compress`] or any CRAM 3.0 rANS 4x8
/// encoder.  The header's raw length must equal `raw_size`; it is checked
/// before any output is allocated.
pub fn decompress(data: &[u8], raw_size: usize) -> Result<Vec<u8>, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(corrupt("header truncated"));
    }
    let order = data[0];
    let comp_len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let raw_len  = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if raw_len != raw_size {
        return Err(corrupt(&format!("stream declares {raw_len} bytes, block declares {raw_size}")));
    }

    if raw_len == 0 {
        return Ok(Vec::new());
    }
    let body = data[HEADER_LEN..]
        .get(..comp_len)
        .ok_or_else(|| corrupt("payload shorter than declared"))?;

    let mut input = Input { buf: body, pos: 0 };
    match order {
        0 => decode_o0(&mut input, raw_len),
        1 => decode_o1(&mut input, raw_len),
        other => Err(corrupt(&format!("unknown model order {other}"))),
    }
}

fn corrupt(msg: &str) -> CodecError {
    CodecError::Decompression(format!("rANS: {msg}"))
}

struct Input<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Input<'_> {
    #[inline]
    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| corrupt("unexpected end of stream"))?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn u32_le(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        for slot in &mut b {
            *slot = self.byte()?;
        }
        Ok(u32::from_le_bytes(b))
    }

    fn freq(&mut self) -> Result<u32, CodecError> {
        let f = self.byte()? as u32;
        if f < 128 {
            Ok(f)
        } else {
            Ok(((f & 0x7f) << 8) | self.byte()? as u32)
        }
    }

    #[inline]
    fn renorm(&mut self, x: &mut u32) -> Result<(), CodecError> {
        while *x < RANS_BYTE_L {
            *x = (*x << 8) | self.byte()? as u32;
        }
        Ok(())
    }
}

/// Walk a run-length coded index list, calling `entry` for every index.
fn read_rle_list<F>(input: &mut Input<'_>, mut entry: F) -> Result<(), CodecError>
where
    F: FnMut(&mut Input<'_>, usize) -> Result<(), CodecError>,
{
    let mut rle = 0usize;
    let mut j = input.byte()? as usize;
    loop {
        entry(input, j)?;
        if rle == 0 && j < 255 && input.peek() == Some((j + 1) as u8) {
            j = input.byte()? as usize;
            rle = input.byte()? as usize;
        } else if rle > 0 {
            rle -= 1;
            j += 1;
            if j > 255 {
                return Err(corrupt("symbol run overflows alphabet"));
            }
        } else {
            j = input.byte()? as usize;
        }
        if j == 0 {
            return Ok(());
        }
    }
}

/// Decoding model for one context.
struct Model {
    freqs:  [u32; 256],
    starts: [u32; 256],
    lookup: Vec<u8>,
}

impl Model {
    fn read(input: &mut Input<'_>) -> Result<Self, CodecError> {
        let mut freqs = [0u32; 256];
        let mut starts = [0u32; 256];
        let mut total = 0u32;
        read_rle_list(input, |input, sym| {
            let f = input.freq()?;
            starts[sym] = total;
            freqs[sym] = f;
            total += f;
            Ok(())
        })?;
        if total > TOTFREQ {
            return Err(corrupt("frequencies exceed total"));
        }

        let mut lookup = vec![0u8; TOTFREQ as usize];
        for sym in 0..256 {
            let (s, f) = (starts[sym] as usize, freqs[sym] as usize);
            lookup[s..s + f].fill(sym as u8);
        }
        Ok(Self { freqs, starts, lookup })
    }

    #[inline]
    fn decode(&self, x: &mut u32) -> u8 {
        let m = *x & MASK;
        let sym = self.lookup[m as usize];
        let s = sym as usize;
        *x = self.freqs[s]
            .wrapping_mul(*x >> TF_SHIFT)
            .wrapping_add(m)
            .wrapping_sub(self.starts[s]);
        sym
    }
}

fn read_states(input: &mut Input<'_>) -> Result<[u32; 4], CodecError> {
    Ok([input.u32_le()?, input.u32_le()?, input.u32_le()?, input.u32_le()?])
}

fn decode_o0(input: &mut Input<'_>, raw_len: usize) -> Result<Vec<u8>, CodecError> {
    let model = Model::read(input)?;
    let mut r = read_states(input)?;
    let mut out = vec![0u8; raw_len];

    let body_end = raw_len & !3;
    for group in out[..body_end].chunks_exact_mut(4) {
        for k in 0..4 {
            group[k] = model.decode(&mut r[k]);
        }
        for x in r.iter_mut() {
            input.renorm(x)?;
        }
    }
    for k in 0..raw_len & 3 {
        out[body_end + k] = model.decode(&mut r[k]);
        input.renorm(&mut r[k])?;
    }
    Ok(out)
}

fn context_model(models: &[Option<Model>], ctx: u8) -> Result<&Model, CodecError> {
    models[ctx as usize].as_ref().ok_or_else(|| corrupt("symbol in undeclared context"))
}

fn decode_o1(input: &mut Input<'_>, raw_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut models: Vec<Option<Model>> = (0..256).map(|_| None).collect();
    read_rle_list(input, |input, ctx| {
        models[ctx] = Some(Model::read(input)?);
        Ok(())
    })?;

    let mut r = read_states(input)?;
    let mut out = vec![0u8; raw_len];
    let q = raw_len >> 2;
    let mut last = [0u8; 4];

    for t in 0..q {
        for k in 0..4 {
            let sym = context_model(&models, last[k])?.decode(&mut r[k]);
            out[k * q + t] = sym;
            last[k] = sym;
        }
        for x in r.iter_mut() {
            input.renorm(x)?;
        }
    }
    for p in 4 * q..raw_len {
        let sym = context_model(&models, last[3])?.decode(&mut r[3]);
        out[p] = sym;
        last[3] = sym;
        input.renorm(&mut r[3])?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut v = Vec::new();
        for i in 0..5000u32 {
            v.push(b"ACGTNACGTTTA"[(i as usize * 7 + (i as usize >> 3)) % 12]);
        }
        v
    }

    #[test]
    fn order0_roundtrip() {
        let data = sample();
        let packed = compress(&data, Order::Zero).unwrap();
        assert_eq!(packed[0], 0);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn order1_roundtrip_with_remainder() {
        for len in [4usize, 5, 6, 7, 8, 63, 1001] {
            let data: Vec<u8> = sample().into_iter().take(len).collect();
            let packed = compress(&data, Order::One).unwrap();
            assert_eq!(packed[0], 1, "len {len}");
            assert_eq!(decompress(&packed, len).unwrap(), data, "len {len}");
        }
    }

    #[test]
    fn short_inputs_fall_back_to_order0() {
        for data in [&b""[..], b"A", b"AC", b"ACG"] {
            let packed = compress(data, Order::One).unwrap();
            assert_eq!(packed[0], 0);
            assert_eq!(decompress(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn single_symbol_and_full_alphabet() {
        let same = vec![b'N'; 777];
        assert_eq!(decompress(&compress(&same, Order::Zero).unwrap(), same.len()).unwrap(), same);
        assert_eq!(decompress(&compress(&same, Order::One).unwrap(), same.len()).unwrap(), same);

        let all: Vec<u8> = (0..=255u8).cycle().take(4096 + 3).collect();
        assert_eq!(decompress(&compress(&all, Order::Zero).unwrap(), all.len()).unwrap(), all);
        assert_eq!(decompress(&compress(&all, Order::One).unwrap(), all.len()).unwrap(), all);
    }

    #[test]
    fn header_fields() {
        let data = b"ACGTACGTAC";
        let packed = compress(data, Order::Zero).unwrap();
        let comp_len = u32::from_le_bytes(packed[1..5].try_into().unwrap()) as usize;
        let raw_len  = u32::from_le_bytes(packed[5..9].try_into().unwrap()) as usize;
        assert_eq!(comp_len, packed.len() - HEADER_LEN);
        assert_eq!(raw_len, data.len());
    }

    #[test]
    fn symbol_table_run_length_coding() {
        // Symbols 1,2,3 present; 5 present alone.
        let mut freqs = [0u32; 256];
        freqs[1] = 10;
        freqs[2] = 200;
        freqs[3] = 1;
        freqs[5] = 7;
        let mut out = Vec::new();
        write_symbol_table(&mut out, &freqs);
        assert_eq!(out, vec![1, 10, 2, 1, 0x80, 200, 1, 5, 7, 0]);

        let mut input = Input { buf: &out, pos: 0 };
        let model = Model::read(&mut input).unwrap();
        assert_eq!(input.pos, out.len());
        assert_eq!(model.freqs, freqs);
        assert_eq!(model.starts[2], 10);
        assert_eq!(model.starts[5], 211);
    }

    #[test]
    fn normalised_tables_sum_to_total() {
        let mut counts = [0u32; 256];
        for (i, c) in counts.iter_mut().enumerate() {
            *c = if i < 128 { 1 } else { 1000 + i as u32 };
        }
        let freqs = normalise(&counts);
        assert_eq!(freqs.iter().sum::<u32>(), TOTFREQ);
        assert!(freqs.iter().all(|&f| f >= 1));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let data = sample();
        for order in [Order::Zero, Order::One] {
            let packed = compress(&data, order).unwrap();
            for cut in [3, HEADER_LEN, HEADER_LEN + 5, packed.len() / 2, packed.len() - 1] {
                assert!(decompress(&packed[..cut], data.len()).is_err(), "{order:?} cut at {cut}");
            }
        }
    }

    #[test]
    fn unknown_order_is_rejected() {
        let mut packed = compress(b"ACGTACGT", Order::Zero).unwrap();
        packed[0] = 7;
        assert!(matches!(decompress(&packed, 8), Err(CodecError::Decompression(_))));
    }

    #[test]
    fn declared_length_mismatch_is_rejected_before_decoding() {
        // One symbol at full frequency, states at the lower bound: decodes to
        // any length the header asks for.
        let mut packed = vec![0u8];
        packed.extend_from_slice(&20u32.to_le_bytes());
        packed.extend_from_slice(&(1u32 << 30).to_le_bytes());
        packed.extend_from_slice(&[b'A', 0x90, 0x00, 0x00]);
        for _ in 0..4 {
            packed.extend_from_slice(&RANS_BYTE_L.to_le_bytes());
        }
        assert_eq!(packed.len(), HEADER_LEN + 20);

        let err = decompress(&packed, 3).unwrap_err();
        assert!(matches!(err, CodecError::Decompression(ref m) if m.contains("declares")));
    }

    // CRAM 3.0 streams for "noodles" whose tables sum to 4095, as htscodecs
    // normalises them.
    const NOODLES_O0: [u8; 46] = [
        0x00, 0x25, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x64, 0x82, 0x49, 0x65, 0x00,
        0x82, 0x49, 0x6c, 0x82, 0x49, 0x6e, 0x82, 0x49, 0x6f, 0x00, 0x84, 0x92, 0x73, 0x82,
        0x49, 0x00, 0xe2, 0x06, 0x83, 0x18, 0x74, 0x7b, 0x41, 0x0c, 0x2b, 0xa9, 0x41, 0x0c,
        0x25, 0x31, 0x80, 0x03,
    ];

    const NOODLES_O1: [u8; 68] = [
        0x01, 0x3b, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x64, 0x84, 0x00, 0x6e,
        0x84, 0x00, 0x6f, 0x00, 0x87, 0xff, 0x00, 0x64, 0x6c, 0x8f, 0xff, 0x00, 0x65, 0x00,
        0x73, 0x8f, 0xff, 0x00, 0x6c, 0x65, 0x8f, 0xff, 0x00, 0x6e, 0x6f, 0x8f, 0xff, 0x00,
        0x6f, 0x00, 0x64, 0x87, 0xff, 0x6f, 0x88, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x02,
        0x02, 0x28, 0x00, 0x01, 0x02, 0x28, 0x00, 0x01, 0x02, 0x60, 0x00, 0x02,
    ];

    #[test]
    fn decodes_reference_order0_stream() {
        assert_eq!(decompress(&NOODLES_O0, 7).unwrap(), b"noodles");
    }

    #[test]
    fn decodes_reference_order1_stream() {
        assert_eq!(decompress(&NOODLES_O1, 7).unwrap(), b"noodles");
    }
}
