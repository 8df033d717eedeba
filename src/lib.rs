//! Firmware core of a phase-shift full-bridge converter controller.
//!
//! The library is hardware independent and runs its unit tests on the
//! host. The STM32G474 binding lives in [`stm32_board`] behind the `stm32`
//! feature.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod logging;

pub mod adc_channel;
pub mod adc_filter;
pub mod api_server;
pub mod app_config;
pub mod app_controller;
pub mod app_state;
pub mod aux_hw_drv;
pub mod board;
pub mod event_bits;
pub mod multi_timer;
pub mod ps_pwm;
pub mod sensor_kty81;
pub mod settings_store;

#[cfg(feature = "stm32")]
pub mod stm32_board;

#[cfg(test)]
pub(crate) mod mock;
