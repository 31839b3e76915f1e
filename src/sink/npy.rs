//! NPY v1.0 headers for raw frame dumps.

use crate::capture::Geometry;

const MAGIC: &[u8] = b"\x93NUMPY";
const ALIGN: usize = 64;

/// Array shape of a frame: `(h, w)` for single channel, `(h, w, c)` otherwise.
pub fn frame_shape(geometry: &Geometry) -> Vec<usize> {
    let mut shape = vec![geometry.height as usize, geometry.width as usize];
    if geometry.format.channels() > 1 {
        shape.push(geometry.format.channels());
    }
    shape
}

/// Full NPY preamble (magic, version, length, dict) for a C-ordered array.
pub fn header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let dims = match shape {
        [single] => format!("({single},)"),
        _ => format!(
            "({})",
            shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {dims}, }}");

    // magic + version + u16 length, then the dict padded so data starts aligned
    let preamble = MAGIC.len() + 2 + 2;
    let unpadded = preamble + dict.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let mut out = Vec::with_capacity(preamble + dict.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out
}
