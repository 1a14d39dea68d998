use chrono::Utc;
use rand::rngs::ThreadRng;
use rand::thread_rng;
use rand_distr::{Distribution, Normal};

use terra_shared::utils::{epoch_micros, iso_utc};
use terra_shared::{TelemetryReading, TimeFormat, TimeValue};

// 通道取值范围
const TEMP_MIN: f64 = 13.0;
const TEMP_MAX: f64 = 21.0;
const HUMIDITY_MIN: f64 = 60.0;
const HUMIDITY_MAX: f64 = 90.0;
const PRESSURE_MIN: f64 = 1000.0;
const PRESSURE_MAX: f64 = 1030.0;

// 每步标准差，远小于取值范围，遥测曲线因此平滑
const SHT_TEMP_SIGMA: f64 = 0.1;
const QMP_TEMP_SIGMA: f64 = 0.1;
const HUMIDITY_SIGMA: f64 = 0.5;
const PRESSURE_SIGMA: f64 = 0.2;

/// 环境传感器模拟器
///
/// 各通道以截断高斯随机游走演化：新值从以当前值为中心的正态分布
/// 采样，越界时截回范围内。输出值保留两位小数，计数器从 1 开始严格递增。
pub struct EnvironmentalSensor {
    time_format: TimeFormat,
    count: u64,
    sht_temperature: f64,
    qmp_temperature: f64,
    humidity: f64,
    pressure: f64,
}

impl EnvironmentalSensor {
    pub fn new(time_format: TimeFormat) -> Self {
        let mut rng = thread_rng();

        Self {
            time_format,
            count: 0,
            // 初值：范围中点附近的高斯采样，σ = 范围/8
            sht_temperature: initial_value(&mut rng, TEMP_MIN, TEMP_MAX),
            qmp_temperature: initial_value(&mut rng, TEMP_MIN, TEMP_MAX),
            humidity: initial_value(&mut rng, HUMIDITY_MIN, HUMIDITY_MAX),
            pressure: initial_value(&mut rng, PRESSURE_MIN, PRESSURE_MAX),
        }
    }

    /// 生成下一条遥测读数，不会失败
    pub fn next_reading(&mut self) -> TelemetryReading {
        let mut rng = thread_rng();

        self.count += 1;
        self.sht_temperature = step(
            &mut rng,
            self.sht_temperature,
            SHT_TEMP_SIGMA,
            TEMP_MIN,
            TEMP_MAX,
        );
        self.qmp_temperature = step(
            &mut rng,
            self.qmp_temperature,
            QMP_TEMP_SIGMA,
            TEMP_MIN,
            TEMP_MAX,
        );
        self.humidity = step(
            &mut rng,
            self.humidity,
            HUMIDITY_SIGMA,
            HUMIDITY_MIN,
            HUMIDITY_MAX,
        );
        self.pressure = step(
            &mut rng,
            self.pressure,
            PRESSURE_SIGMA,
            PRESSURE_MIN,
            PRESSURE_MAX,
        );

        TelemetryReading {
            sht_temperature: round2(self.sht_temperature),
            qmp_temperature: round2(self.qmp_temperature),
            humidity: round2(self.humidity),
            pressure: round2(self.pressure),
            count: self.count,
            time: self.time_value(),
        }
    }

    fn time_value(&self) -> Option<TimeValue> {
        match self.time_format {
            TimeFormat::None => None,
            TimeFormat::Epoch => Some(TimeValue::Epoch(epoch_micros())),
            TimeFormat::Iso => Some(TimeValue::Iso(iso_utc(Utc::now()))),
        }
    }
}

fn initial_value(rng: &mut ThreadRng, min: f64, max: f64) -> f64 {
    let mid = (min + max) / 2.0;
    let sigma = (max - min) / 8.0;
    let normal = Normal::new(mid, sigma).expect("invalid normal sigma");
    normal.sample(rng).clamp(min, max)
}

fn step(rng: &mut ThreadRng, current: f64, sigma: f64, min: f64, max: f64) -> f64 {
    let normal = Normal::new(current, sigma).expect("invalid normal sigma");
    normal.sample(rng).clamp(min, max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
