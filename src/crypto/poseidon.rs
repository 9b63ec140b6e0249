//! Poseidon permutation over the BN254 scalar field.
//!
//! Parameters: t = 3, x^5 S-box, 8 full rounds (4 + 4) and 57 partial
//! rounds, 128-bit security. Round constants are expanded from the fixed
//! domain tag `agora-poseidon-v1` with SHA-256; the MDS matrix is the
//! Cauchy matrix over x_i = i, y_j = t + j. This instance is frozen for
//! the lifetime of a deployment - changing any parameter changes every
//! nullifier and leaf hash derived under the `poseidon` registry variant.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// BN254 scalar field modulus, 4 x 64-bit little-endian limbs.
const MODULUS: [u64; 4] = [
    0x43e1f593f0000001,
    0x2833e84879b97091,
    0xb85045b68181585d,
    0x30644e72e131a029,
];

/// Modulus - 2, the Fermat inversion exponent.
const MODULUS_MINUS_2: [u64; 4] = [
    0x43e1f593efffffff,
    0x2833e84879b97091,
    0xb85045b68181585d,
    0x30644e72e131a029,
];

/// 2^256 mod p, used by the wide-reduction fold.
const K_FOLD: [u64; 4] = [
    0xac96341c4ffffffb,
    0x36fc76959f60cd29,
    0x666ea36f7879462e,
    0x0e0a77c19a07df2f,
];

const T: usize = 3;
const FULL_ROUNDS: usize = 8;
const PARTIAL_ROUNDS: usize = 57;

/// Field element as 4 x 64-bit little-endian limbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Fr {
    limbs: [u64; 4],
}

impl Fr {
    pub const ZERO: Fr = Fr { limbs: [0; 4] };
    pub const ONE: Fr = Fr { limbs: [1, 0, 0, 0] };

    pub fn from_u64(n: u64) -> Self {
        Fr { limbs: [n, 0, 0, 0] }
    }

    /// Interpret 32 big-endian bytes as an integer and reduce mod p.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            // chunk 0 is the most significant limb
            limbs[3 - i] = u64::from_be_bytes(buf);
        }
        let mut fr = Fr { limbs };
        fr.normalize();
        fr
    }

    /// Big-endian 32-byte form of the reduced element.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..4 {
            out[i * 8..(i + 1) * 8].copy_from_slice(&self.limbs[3 - i].to_be_bytes());
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.limbs == [0; 4]
    }

    fn gte_modulus(&self) -> bool {
        gte(&self.limbs, &MODULUS)
    }

    /// Subtract the modulus until the value lies in [0, p).
    /// A raw 256-bit value is at most ~5.7 p, so this loops at most 6 times.
    fn normalize(&mut self) {
        while self.gte_modulus() {
            self.limbs = sub_limbs(&self.limbs, &MODULUS);
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        // Reduced operands are below 2^254, so the sum never carries out
        // of the fourth limb.
        let (limbs, _) = add_limbs(&self.limbs, &other.limbs);
        let mut r = Fr { limbs };
        r.normalize();
        r
    }

    pub fn sub(&self, other: &Self) -> Self {
        if gte(&self.limbs, &other.limbs) {
            Fr {
                limbs: sub_limbs(&self.limbs, &other.limbs),
            }
        } else {
            // self + p fits in 256 bits (p < 2^254) and exceeds other.
            let (lifted, _) = add_limbs(&self.limbs, &MODULUS);
            Fr {
                limbs: sub_limbs(&lifted, &other.limbs),
            }
        }
    }

    pub fn mul(&self, other: &Self) -> Self {
        let wide = mul_wide(&self.limbs, &other.limbs);
        reduce_wide(&wide)
    }

    /// x^5, the Poseidon S-box.
    pub fn pow5(&self) -> Self {
        let x2 = self.mul(self);
        let x4 = x2.mul(&x2);
        x4.mul(self)
    }

    /// Square-and-multiply exponentiation by a 256-bit exponent.
    fn pow(&self, exp: &[u64; 4]) -> Self {
        let mut result = Fr::ONE;
        for limb_idx in (0..4).rev() {
            for bit in (0..64).rev() {
                result = result.mul(&result);
                if (exp[limb_idx] >> bit) & 1 == 1 {
                    result = result.mul(self);
                }
            }
        }
        result
    }

    /// Multiplicative inverse via Fermat. Zero inverts to zero.
    pub fn inverse(&self) -> Self {
        self.pow(&MODULUS_MINUS_2)
    }
}

fn gte(a: &[u64; 4], b: &[u64; 4]) -> bool {
    for i in (0..4).rev() {
        if a[i] > b[i] {
            return true;
        }
        if a[i] < b[i] {
            return false;
        }
    }
    true
}

fn sub_limbs(a: &[u64; 4], b: &[u64; 4]) -> [u64; 4] {
    let mut out = [0u64; 4];
    let mut borrow = 0i128;
    for i in 0..4 {
        let diff = a[i] as i128 - b[i] as i128 - borrow;
        if diff < 0 {
            out[i] = (diff + (1i128 << 64)) as u64;
            borrow = 1;
        } else {
            out[i] = diff as u64;
            borrow = 0;
        }
    }
    out
}

fn add_limbs(a: &[u64; 4], b: &[u64; 4]) -> ([u64; 4], u64) {
    let mut out = [0u64; 4];
    let mut carry = 0u128;
    for i in 0..4 {
        let sum = a[i] as u128 + b[i] as u128 + carry;
        out[i] = sum as u64;
        carry = sum >> 64;
    }
    (out, carry as u64)
}

/// Schoolbook 256 x 256 -> 512-bit multiplication.
fn mul_wide(a: &[u64; 4], b: &[u64; 4]) -> [u64; 8] {
    let mut out = [0u64; 8];
    for i in 0..4 {
        let mut carry = 0u128;
        for j in 0..4 {
            let tmp = out[i + j] as u128 + a[i] as u128 * b[j] as u128 + carry;
            out[i + j] = tmp as u64;
            carry = tmp >> 64;
        }
        let mut k = i + 4;
        while carry > 0 && k < 8 {
            let tmp = out[k] as u128 + carry;
            out[k] = tmp as u64;
            carry = tmp >> 64;
            k += 1;
        }
    }
    out
}

fn add_wide(a: &[u64; 8], b: &[u64; 8]) -> [u64; 8] {
    let mut out = [0u64; 8];
    let mut carry = 0u128;
    for i in 0..8 {
        let sum = a[i] as u128 + b[i] as u128 + carry;
        out[i] = sum as u64;
        carry = sum >> 64;
    }
    out
}

/// Reduce a 512-bit value mod p by iteratively folding the high half:
/// x mod p = (x_lo + x_hi * (2^256 mod p)) mod p. Each fold shrinks the
/// high half; the loop terminates well inside the iteration cap.
fn reduce_wide(wide: &[u64; 8]) -> Fr {
    let mut acc = *wide;
    for _ in 0..64 {
        if acc[4] == 0 && acc[5] == 0 && acc[6] == 0 && acc[7] == 0 {
            break;
        }
        let hi = [acc[4], acc[5], acc[6], acc[7]];
        let product = mul_wide(&hi, &K_FOLD);
        let mut lo = [0u64; 8];
        lo[..4].copy_from_slice(&acc[..4]);
        acc = add_wide(&lo, &product);
    }
    let mut fr = Fr {
        limbs: [acc[0], acc[1], acc[2], acc[3]],
    };
    fr.normalize();
    fr
}

/// Round constants and MDS matrix for the t = 3 instance.
struct PoseidonParams {
    round_constants: Vec<Fr>,
    mds: [[Fr; 3]; 3],
}

fn params() -> &'static PoseidonParams {
    static PARAMS: OnceLock<PoseidonParams> = OnceLock::new();
    PARAMS.get_or_init(|| {
        let total = (FULL_ROUNDS + PARTIAL_ROUNDS) * T;
        let mut round_constants = Vec::with_capacity(total);
        for i in 0..total {
            let mut hasher = Sha256::new();
            hasher.update(b"agora-poseidon-v1/rc/");
            hasher.update((i as u64).to_be_bytes());
            let digest: [u8; 32] = hasher.finalize().into();
            round_constants.push(Fr::from_be_bytes(&digest));
        }

        // Cauchy MDS: m[i][j] = 1 / (x_i + y_j), x_i = i, y_j = T + j.
        // All sums are distinct and non-zero, so the matrix is invertible.
        let mut mds = [[Fr::ZERO; 3]; 3];
        for (i, row) in mds.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                let sum = Fr::from_u64((i + T + j) as u64);
                *cell = sum.inverse();
            }
        }

        PoseidonParams {
            round_constants,
            mds,
        }
    })
}

fn mds_multiply(state: &[Fr; 3], m: &[[Fr; 3]; 3]) -> [Fr; 3] {
    let mut out = [Fr::ZERO; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i] = out[i].add(&state[j].mul(&m[i][j]));
        }
    }
    out
}

/// The Poseidon permutation applied to a t = 3 state, returning state[0].
fn permute(mut state: [Fr; 3]) -> Fr {
    let p = params();
    let mut round = 0;

    let ark = |state: &mut [Fr; 3], round: usize| {
        for i in 0..T {
            state[i] = state[i].add(&p.round_constants[round * T + i]);
        }
    };

    for _ in 0..FULL_ROUNDS / 2 {
        ark(&mut state, round);
        for item in state.iter_mut() {
            *item = item.pow5();
        }
        state = mds_multiply(&state, &p.mds);
        round += 1;
    }

    for _ in 0..PARTIAL_ROUNDS {
        ark(&mut state, round);
        state[0] = state[0].pow5();
        state = mds_multiply(&state, &p.mds);
        round += 1;
    }

    for _ in 0..FULL_ROUNDS / 2 {
        ark(&mut state, round);
        for item in state.iter_mut() {
            *item = item.pow5();
        }
        state = mds_multiply(&state, &p.mds);
        round += 1;
    }

    state[0]
}

/// Two-to-one compression: state [0, a, b] through the permutation.
pub fn poseidon2(a: &Fr, b: &Fr) -> Fr {
    permute([Fr::ZERO, *a, *b])
}

/// Hash a sequence of field elements by chaining the 2:1 compression.
pub fn hash_elements(elements: &[Fr]) -> Fr {
    let mut acc = Fr::ZERO;
    for element in elements {
        acc = poseidon2(&acc, element);
    }
    acc
}

/// Encode arbitrary bytes as field elements: the total length first, then
/// the input split into 31-byte big-endian chunks (each strictly below p).
/// The leading length element separates inputs that differ only by
/// trailing zero padding.
pub fn bytes_to_elements(data: &[u8]) -> Vec<Fr> {
    let mut elements = Vec::with_capacity(1 + data.len() / 31 + 1);
    elements.push(Fr::from_u64(data.len() as u64));
    for chunk in data.chunks(31) {
        let mut buf = [0u8; 32];
        buf[32 - chunk.len()..].copy_from_slice(chunk);
        elements.push(Fr::from_be_bytes(&buf));
    }
    elements
}

/// Hash arbitrary bytes through the sponge chain.
pub fn hash_bytes(data: &[u8]) -> Fr {
    hash_elements(&bytes_to_elements(data))
}
