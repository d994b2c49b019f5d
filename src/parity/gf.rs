//! GF(2^8) arithmetic and the Cauchy matrix machinery behind the erasure
//! code. Scalar implementation; outputs match the usual Reed-Solomon field
//! (polynomial 0x11D, generator 2).

const FIELD_POLY: u16 = 0x11D;

const fn build_tables() -> ([u8; 256], [u8; 512]) {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= FIELD_POLY;
        }
        i += 1;
    }
    // Mirror the cycle so mul() can index log(a)+log(b) directly.
    let mut j = 0;
    while j < 255 {
        exp[255 + j] = exp[j];
        j += 1;
    }
    (log, exp)
}

const TABLES: ([u8; 256], [u8; 512]) = build_tables();
const LOG: [u8; 256] = TABLES.0;
const EXP: [u8; 512] = TABLES.1;

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Multiplicative inverse; `a` must be nonzero.
#[inline]
pub fn inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0);
    EXP[255 - LOG[a as usize] as usize]
}

/// Multiplication table for a fixed coefficient, for the hot XOR loops.
pub fn mul_table(c: u8) -> [u8; 256] {
    let mut t = [0u8; 256];
    if c == 0 {
        return t;
    }
    let lc = LOG[c as usize] as usize;
    for (x, slot) in t.iter_mut().enumerate().skip(1) {
        *slot = EXP[lc + LOG[x] as usize];
    }
    t
}

/// Build the `(nd+np) x nd` Cauchy-1 encode matrix, row-major.
///
/// The first `nd` rows are the identity; parity row `p`, column `j` is
/// `1 / (p XOR (np + j))`. Indices stay distinct as long as
/// `nd + np <= 256`, which makes every square submatrix drawn from any `nd`
/// surviving rows invertible.
pub fn gen_cauchy1_matrix(nd: usize, np: usize) -> Vec<u8> {
    assert!(nd + np <= 256);
    let mut m = vec![0u8; (nd + np) * nd];
    for i in 0..nd {
        m[i * nd + i] = 1;
    }
    for p in 0..np {
        for j in 0..nd {
            m[(nd + p) * nd + j] = inv((p ^ (np + j)) as u8);
        }
    }
    m
}

/// Invert an `n x n` matrix by Gauss-Jordan elimination.
/// Returns `None` if the matrix is singular.
pub fn invert_matrix(src: &[u8], n: usize) -> Option<Vec<u8>> {
    assert_eq!(src.len(), n * n);
    let mut a = src.to_vec();
    let mut out = vec![0u8; n * n];
    for i in 0..n {
        out[i * n + i] = 1;
    }

    for col in 0..n {
        let pivot = (col..n).find(|&r| a[r * n + col] != 0)?;
        if pivot != col {
            for j in 0..n {
                a.swap(pivot * n + j, col * n + j);
                out.swap(pivot * n + j, col * n + j);
            }
        }

        let scale = inv(a[col * n + col]);
        for j in 0..n {
            a[col * n + j] = mul(a[col * n + j], scale);
            out[col * n + j] = mul(out[col * n + j], scale);
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor == 0 {
                continue;
            }
            for j in 0..n {
                let av = mul(a[col * n + j], factor);
                let ov = mul(out[col * n + j], factor);
                a[row * n + j] ^= av;
                out[row * n + j] ^= ov;
            }
        }
    }

    Some(out)
}

/// `out[i] ^= c * src[i]` over the whole block.
pub fn xor_mul(out: &mut [u8], src: &[u8], c: u8) {
    debug_assert_eq!(out.len(), src.len());
    if c == 0 {
        return;
    }
    if c == 1 {
        for (o, s) in out.iter_mut().zip(src) {
            *o ^= s;
        }
        return;
    }
    let t = mul_table(c);
    for (o, s) in out.iter_mut().zip(src) {
        *o ^= t[*s as usize];
    }
}

/// Apply `rows` coefficient rows (each of length `k`, row-major in `coeffs`)
/// to `k` source blocks, producing one output block per row.
pub fn encode_blocks(k: usize, coeffs: &[u8], sources: &[&[u8]], outputs: &mut [&mut [u8]]) {
    debug_assert_eq!(sources.len(), k);
    debug_assert_eq!(coeffs.len(), k * outputs.len());
    for (r, out) in outputs.iter_mut().enumerate() {
        out.fill(0);
        for (d, src) in sources.iter().enumerate() {
            xor_mul(out, src, coeffs[r * k + d]);
        }
    }
}
