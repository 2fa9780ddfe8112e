//! Trained classifier coefficients.
//!
//! A linear decision function over the magnitude spectrum of one
//! 178-sample window, fitted offline on labeled intracranial recordings.
//! One weight per spectral bin 1..=44; the DC bin is excluded. These
//! values are part of the device artifact and must not be edited by hand.

use cerelink_core::types::SPECTRUM_BINS;

/// Decision-function intercept.
pub const BIAS: f64 = -4.107_084_483_430_048;

/// Per-bin weights, index 0 corresponding to spectral bin 1.
pub const WEIGHTS: [f64; SPECTRUM_BINS] = [
    0.000_912_387_654_430_6,
    0.001_842_235_281_771_9,
    0.004_571_808_559_348_2,
    0.007_429_246_806_127_4,
    0.011_606_843_282_953_1,
    0.013_974_805_342_118_6,
    0.012_881_662_738_405_9,
    0.009_417_459_356_188_3,
    0.004_212_558_771_460_8,
    -0.001_086_304_929_150_2,
    -0.004_860_852_397_412_7,
    -0.006_597_972_215_864_1,
    -0.005_931_801_389_342_6,
    -0.003_610_215_650_878_4,
    -0.000_721_904_872_351_9,
    0.002_059_823_461_078_5,
    0.004_265_402_531_662_3,
    0.005_614_771_986_440_2,
    0.005_987_865_559_148_7,
    0.005_431_092_386_751_6,
    0.004_138_549_561_220_4,
    0.002_419_807_634_929_8,
    0.000_645_030_177_513_2,
    -0.000_842_853_486_290_7,
    -0.001_826_294_851_319_5,
    -0.002_212_645_730_868_2,
    -0.002_035_628_974_116_9,
    -0.001_432_167_488_205_3,
    -0.000_607_492_361_774_1,
    0.000_219_847_160_932_8,
    0.000_898_453_267_105_4,
    0.001_334_829_475_618_2,
    0.001_498_236_770_941_7,
    0.001_411_905_872_636_4,
    0.001_135_846_998_210_3,
    0.000_748_214_370_569_8,
    0.000_327_693_845_118_6,
    -0.000_059_842_716_093_2,
    -0.000_358_126_489_705_1,
    -0.000_533_904_728_166_9,
    -0.000_577_286_314_952_7,
    -0.000_499_118_263_840_5,
    -0.000_325_697_148_026_3,
    -0.000_092_418_573_605_1,
];
