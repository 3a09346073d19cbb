use noise::{NoiseFn, Perlin};

/// Stateless 64-bit mixer used to derive per-octave and per-chunk seeds.
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seed for a per-chunk random stream. `salt` separates features sharing a chunk.
pub fn chunk_seed(seed: u64, chunk_x: i32, chunk_z: i32, salt: u64) -> u64 {
    let mut h = seed ^ salt.wrapping_mul(0xD6E8FEB86659FD93);
    h ^= (chunk_x as i64 as u64).wrapping_mul(341873128712);
    h ^= (chunk_z as i64 as u64).wrapping_mul(132897987541);
    splitmix64(h)
}

/// Fractal sum of independently seeded octaves.
///
/// Octave `i` is sampled at frequency `2^i / scale` with amplitude
/// `persistence^i`, and the total is divided by the amplitude sum so the
/// output stays within the source's range.
#[derive(Clone, Debug)]
pub struct OctaveNoise<N = Perlin> {
    octaves: Vec<N>,
}

impl OctaveNoise<Perlin> {
    pub fn new(seed: u64, octave_count: u32) -> Self {
        let mut state = seed;
        let octaves = (0..octave_count.max(1))
            .map(|_| {
                state = splitmix64(state);
                Perlin::new((state >> 32) as u32)
            })
            .collect();
        Self { octaves }
    }
}

impl<N> OctaveNoise<N>
where
    N: NoiseFn<f64, 2> + NoiseFn<f64, 3>,
{
    pub fn from_sources(octaves: Vec<N>) -> Self {
        Self { octaves }
    }

    pub fn octave_count(&self) -> usize {
        self.octaves.len()
    }

    pub fn sample_2d(&self, x: f64, z: f64, scale: f64, persistence: f64) -> f64 {
        let mut total = 0.0;
        let mut max_value = 0.0;
        let mut frequency = 1.0 / scale;
        let mut amplitude = 1.0;

        for octave in &self.octaves {
            total += NoiseFn::<f64, 2>::get(octave, [x * frequency, z * frequency]) * amplitude;
            max_value += amplitude;
            frequency *= 2.0;
            amplitude *= persistence;
        }

        if max_value > 0.0 {
            total / max_value
        } else {
            0.0
        }
    }

    pub fn sample_3d(&self, x: f64, y: f64, z: f64, scale: f64, persistence: f64) -> f64 {
        let mut total = 0.0;
        let mut max_value = 0.0;
        let mut frequency = 1.0 / scale;
        let mut amplitude = 1.0;

        for octave in &self.octaves {
            total += NoiseFn::<f64, 3>::get(
                octave,
                [x * frequency, y * frequency, z * frequency],
            ) * amplitude;
            max_value += amplitude;
            frequency *= 2.0;
            amplitude *= persistence;
        }

        if max_value > 0.0 {
            total / max_value
        } else {
            0.0
        }
    }

    /// `sample_2d` rescaled from [-1, 1] to [0, 1].
    pub fn sample_2d_unit(&self, x: f64, z: f64, scale: f64, persistence: f64) -> f64 {
        ((self.sample_2d(x, z, scale, persistence) + 1.0) * 0.5).clamp(0.0, 1.0)
    }
}
