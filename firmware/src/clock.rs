//! System PLL control for the RP2040.
//!
//! `embassy-rp` only configures the clocks at boot. Sample rate changes move the system PLL between the two rate
//! families at runtime, with the system clock parked on the reference clock meanwhile. Only the S/PDIF shifter
//! depends on the system clock frequency, and its divider is retuned after every switch. The USB PLL is left alone.
use audio::clock::{PllConfig, SystemClock};
use audio::{Error, SampleRate};
use embassy_rp::clocks::{ClockConfig, PllConfig as RpPllConfig};
use embassy_rp::config::Config;
use embassy_rp::pac;
use embassy_rp::pac::clocks::vals::{ClkSysCtrlAuxsrc, ClkSysCtrlSrc};

// Limits of the RP2040 PLL [RP2040 datasheet 2.18.2]
const VCO_RANGE_HZ: core::ops::RangeInclusive<u32> = 750_000_000..=1_600_000_000;
const FBDIV_RANGE: core::ops::RangeInclusive<u16> = 16..=320;
const POSTDIV_RANGE: core::ops::RangeInclusive<u8> = 1..=7;

fn to_rp(config: &PllConfig, reference_hz: u32) -> RpPllConfig {
    RpPllConfig {
        refdiv: 1,
        fbdiv: config.feedback_divider(reference_hz),
        post_div1: config.post_div1,
        post_div2: config.post_div2,
    }
}

/// Chip configuration with the system clock in the family of `rate`.
pub fn boot_config(rate: SampleRate, xosc_hz: u32) -> Config {
    let mut clocks = ClockConfig::crystal(xosc_hz);

    if let Some(xosc) = clocks.xosc.as_mut() {
        xosc.sys_pll = Some(to_rp(&PllConfig::for_rate(rate), xosc_hz));
    }

    Config::new(clocks)
}

pub struct Rp2040Clock {
    xosc_hz: u32,
}

impl Rp2040Clock {
    pub fn new(xosc_hz: u32) -> Self {
        Self { xosc_hz }
    }

    fn validate(&self, config: &PllConfig) -> Result<RpPllConfig, Error> {
        let rp = to_rp(config, self.xosc_hz);

        if !VCO_RANGE_HZ.contains(&config.vco_hz)
            || !FBDIV_RANGE.contains(&rp.fbdiv)
            || !POSTDIV_RANGE.contains(&rp.post_div1)
            || !POSTDIV_RANGE.contains(&rp.post_div2)
            || rp.post_div2 > rp.post_div1
        {
            return Err(Error::InvalidParameter);
        }

        Ok(rp)
    }
}

impl SystemClock for Rp2040Clock {
    fn set_sys_pll(&mut self, config: &PllConfig) -> Result<(), Error> {
        let rp = self.validate(config)?;
        let clocks = pac::CLOCKS;
        let pll = pac::PLL_SYS;

        critical_section::with(|_| {
            // Park the system clock on the (crystal) reference clock.
            clocks.clk_sys_ctrl().modify(|w| w.set_src(ClkSysCtrlSrc::CLK_REF));
            while clocks.clk_sys_selected().read() != 1 << ClkSysCtrlSrc::CLK_REF as u32 {}

            pll.pwr().write(|w| {
                w.set_pd(true);
                w.set_vcopd(true);
                w.set_postdivpd(true);
            });
            pll.cs().write(|w| w.set_refdiv(rp.refdiv));
            pll.fbdiv_int().write(|w| w.set_fbdiv_int(rp.fbdiv));
            pll.pwr().modify(|w| {
                w.set_pd(false);
                w.set_vcopd(false);
            });
            while !pll.cs().read().lock() {}

            pll.prim().write(|w| {
                w.set_postdiv1(rp.post_div1);
                w.set_postdiv2(rp.post_div2);
            });
            pll.pwr().modify(|w| w.set_postdivpd(false));

            clocks
                .clk_sys_ctrl()
                .modify(|w| w.set_auxsrc(ClkSysCtrlAuxsrc::CLKSRC_PLL_SYS));
            clocks
                .clk_sys_ctrl()
                .modify(|w| w.set_src(ClkSysCtrlSrc::CLKSRC_CLK_SYS_AUX));
            while clocks.clk_sys_selected().read() != 1 << ClkSysCtrlSrc::CLKSRC_CLK_SYS_AUX as u32 {}
        });

        Ok(())
    }
}
