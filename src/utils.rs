/// SplitMix64 finalizer used to decorrelate derived seeds
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Derives a child seed from a parent seed and a stream index
pub fn derive_seed(seed: u64, stream: u64) -> u64 {
    splitmix64(splitmix64(seed) ^ stream)
}

/// Derives the null-model seed for a sweep cutoff
///
/// Depends only on the global seed and the cutoff value so that a cutoff
/// always sees the same random stream regardless of worker scheduling.
pub fn cutoff_seed(seed: u64, cutoff: f64) -> u64 {
    // normalize -0.0 so it shares a stream with 0.0
    let cutoff = if cutoff == 0.0 { 0.0 } else { cutoff };
    derive_seed(seed, cutoff.to_bits())
}

/// Rounds to a fixed number of decimals to keep grid values stable
pub fn round_to(x: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (x * factor).round() / factor
}

/// Compares cutoffs with a tolerance absorbing grid arithmetic noise
pub fn same_cutoff(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
