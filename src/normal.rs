//! Normal-approximation helpers for the exploit gate.
//!
//! [`inverse_normal_cdf`] is Wichura's AS241 (`PPND16`) rational approximation, accurate to
//! about 1e-16 relative error over `(0, 1)`: one rational polynomial for the central region
//! `|p - 0.5| <= 0.425` and two `sqrt(-ln p)`-based ones for the tails.

const SPLIT1: f64 = 0.425;
const SPLIT2: f64 = 5.0;
const CONST1: f64 = 0.180625;
const CONST2: f64 = 1.6;

const A: [f64; 8] = [
    3.387_132_872_796_366_608_0e0,
    1.331_416_678_917_843_774_5e2,
    1.971_590_950_306_551_442_7e3,
    1.373_169_376_550_946_112_5e4,
    4.592_195_393_154_987_145_7e4,
    6.726_577_092_700_870_085_3e4,
    3.343_057_558_358_812_810_5e4,
    2.509_080_928_730_122_672_7e3,
];
const B: [f64; 8] = [
    1.0,
    4.231_333_070_160_091_125_2e1,
    6.871_870_074_920_579_083_0e2,
    5.394_196_021_424_751_107_7e3,
    2.121_379_430_158_659_586_7e4,
    3.930_789_580_009_271_061_0e4,
    2.872_908_573_572_194_267_4e4,
    5.226_495_278_852_854_561_0e3,
];
const C: [f64; 8] = [
    1.423_437_110_749_683_577_34e0,
    4.630_337_846_156_545_295_90e0,
    5.769_497_221_460_691_405_50e0,
    3.647_848_324_763_204_605_04e0,
    1.270_458_252_452_368_382_58e0,
    2.417_807_251_774_506_117_70e-1,
    2.272_384_498_926_918_458_33e-2,
    7.745_450_142_783_414_076_40e-4,
];
const D: [f64; 8] = [
    1.0,
    2.053_191_626_637_758_821_87e0,
    1.676_384_830_183_803_849_40e0,
    6.897_673_349_851_000_045_50e-1,
    1.481_039_764_274_800_745_90e-1,
    1.519_866_656_361_645_719_66e-2,
    5.475_938_084_995_344_946_00e-4,
    1.050_750_071_644_416_843_24e-9,
];
const E: [f64; 8] = [
    6.657_904_643_501_103_777_20e0,
    5.463_784_911_164_114_369_90e0,
    1.784_826_539_917_291_335_80e0,
    2.965_605_718_285_048_912_30e-1,
    2.653_218_952_657_612_309_30e-2,
    1.242_660_947_388_078_438_60e-3,
    2.711_555_568_743_487_578_15e-5,
    2.010_334_399_292_288_132_65e-7,
];
const F: [f64; 8] = [
    1.0,
    5.998_322_065_558_879_376_90e-1,
    1.369_298_809_227_358_053_10e-1,
    1.487_536_129_085_061_485_25e-2,
    7.868_691_311_456_132_591_00e-4,
    1.846_318_317_510_054_681_80e-5,
    1.421_511_758_316_445_888_70e-7,
    2.044_263_103_389_939_785_64e-15,
];

/// Horner evaluation of `c[0] + c[1] r + ... + c[7] r^7`.
#[inline]
fn poly(c: &[f64; 8], r: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, &k| acc * r + k)
}

/// Inverse standard-normal CDF `Φ⁻¹(p)`.
///
/// Returns `-inf`/`+inf` at `p = 0`/`p = 1` and `NaN` outside `[0, 1]`.
#[must_use]
pub fn inverse_normal_cdf(p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }

    let q = p - 0.5;
    if q.abs() <= SPLIT1 {
        let r = CONST1 - q * q;
        return q * poly(&A, r) / poly(&B, r);
    }

    let tail = if q < 0.0 { p } else { 1.0 - p };
    let mut r = (-tail.ln()).sqrt();
    let x = if r <= SPLIT2 {
        r -= CONST2;
        poly(&C, r) / poly(&D, r)
    } else {
        r -= SPLIT2;
        poly(&E, r) / poly(&F, r)
    };
    if q < 0.0 {
        -x
    } else {
        x
    }
}

/// Two-sided critical value `|Φ⁻¹((1 - confidence) / 2)|`, e.g. ≈ 1.96 at 0.95.
#[must_use]
pub fn z_critical(confidence: f64) -> f64 {
    inverse_normal_cdf((1.0 - confidence) / 2.0).abs()
}

/// Full width of the normal-approximation confidence interval for a binomial rate.
///
/// `2 * z * sqrt(p (1 - p) / n)` with `p = successes / trials` (successes clamped to
/// `trials`). Zero trials give `+inf`: an untried arm is never "statistically tight".
#[must_use]
pub fn margin_of_error(successes: u64, trials: u64, confidence: f64) -> f64 {
    if trials == 0 {
        return f64::INFINITY;
    }
    let n = trials as f64;
    let p = successes.min(trials) as f64 / n;
    2.0 * z_critical(confidence) * (p * (1.0 - p) / n).sqrt()
}
