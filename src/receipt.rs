//! Receipt
//!
//! Human-readable rendering of a [`PricedResult`] for support staff: the line
//! breakdown, every applied adjustment, every rejected candidate with its
//! reason, and the totals. A support agent reading the output can answer
//! "why did this customer pay this amount" without querying anything else.

use std::io;

use rusty_money::{Money, MoneyError};
use tabled::{
    builder::Builder,
    settings::{Alignment, Color, Style, object::{Columns, Rows}},
};
use thiserror::Error;

use crate::{pipeline::PricedResult, prices::OverrideSource};

/// Errors that can occur when rendering a receipt.
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// Wrapper for money errors.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// IO error writing the receipt.
    #[error("IO error")]
    Io,
}

/// Renders a priced result as a table plus audit trail.
#[derive(Debug, Clone, Copy)]
pub struct Receipt<'a> {
    result: &'a PricedResult,
}

impl<'a> Receipt<'a> {
    /// Wrap a priced result for rendering.
    #[must_use]
    pub fn new(result: &'a PricedResult) -> Self {
        Self { result }
    }

    /// Render the receipt to a string.
    ///
    /// # Errors
    ///
    /// Returns a [`ReceiptError`] if a money calculation fails.
    pub fn render(&self) -> Result<String, ReceiptError> {
        let mut out = Vec::new();

        self.write_to(&mut out)?;

        String::from_utf8(out).map_err(|_err| ReceiptError::Io)
    }

    /// Write the receipt to the given sink.
    ///
    /// # Errors
    ///
    /// Returns a [`ReceiptError`] if writing fails or a money calculation
    /// fails.
    pub fn write_to(&self, mut out: impl io::Write) -> Result<(), ReceiptError> {
        self.write_lines_table(&mut out)?;
        self.write_adjustments(&mut out)?;
        self.write_rejections(&mut out)?;
        self.write_summary(&mut out)?;

        Ok(())
    }

    fn write_lines_table(&self, out: &mut impl io::Write) -> Result<(), ReceiptError> {
        let mut builder = Builder::default();

        builder.push_record(["", "Item", "Qty", "Base", "Final", "Note"]);

        for (index, line) in self.result.lines.iter().enumerate() {
            let note = line.price_override.map_or(String::new(), |chosen| {
                let source = match chosen.source {
                    OverrideSource::Tier => "tier price",
                    OverrideSource::Customer => "customer price",
                };

                format!("{source} {}", chosen.unit_price)
            });

            builder.push_record([
                format!("#{:<3}", index + 1),
                line.name.clone(),
                line.quantity.to_string(),
                line.base_total.to_string(),
                line.final_total.to_string(),
                note,
            ]);
        }

        for free in &self.result.free_items {
            builder.push_record([
                String::new(),
                format!("{} (free item)", free.product),
                free.quantity.to_string(),
                String::new(),
                Money::from_minor(0, self.result.subtotal.currency()).to_string(),
                String::new(),
            ]);
        }

        let mut table = builder.build();

        table.with(Style::rounded());
        table.modify(Rows::first(), Color::BOLD);
        table.modify(Columns::new(2..5), Alignment::right());

        writeln!(out, "{table}").map_err(|_err| ReceiptError::Io)
    }

    fn write_adjustments(&self, out: &mut impl io::Write) -> Result<(), ReceiptError> {
        if self.result.applied.is_empty() {
            return Ok(());
        }

        writeln!(out, "\nAdjustments:").map_err(|_err| ReceiptError::Io)?;

        for adjustment in &self.result.applied {
            let mut extras = Vec::new();

            if adjustment.free_shipping {
                extras.push("free shipping".to_string());
            }

            if adjustment.points > 0 {
                extras.push(format!("{} points", adjustment.points));
            }

            if !adjustment.free_items.is_empty() {
                extras.push(format!("{} free item(s)", adjustment.free_items.len()));
            }

            let extras = if extras.is_empty() {
                String::new()
            } else {
                format!(" ({})", extras.join(", "))
            };

            writeln!(
                out,
                "  {} -{}{}",
                adjustment.candidate.label(),
                adjustment.amount,
                extras
            )
            .map_err(|_err| ReceiptError::Io)?;
        }

        Ok(())
    }

    fn write_rejections(&self, out: &mut impl io::Write) -> Result<(), ReceiptError> {
        if self.result.rejected.is_empty() {
            return Ok(());
        }

        writeln!(out, "\nNot applied:").map_err(|_err| ReceiptError::Io)?;

        for rejection in &self.result.rejected {
            writeln!(
                out,
                "  {}: {}",
                rejection.candidate.label(),
                rejection.reason
            )
            .map_err(|_err| ReceiptError::Io)?;
        }

        Ok(())
    }

    fn write_summary(&self, out: &mut impl io::Write) -> Result<(), ReceiptError> {
        let result = self.result;

        writeln!(out, "\n Subtotal: {}", result.subtotal).map_err(|_err| ReceiptError::Io)?;

        if result.cart_discount.to_minor_units() > 0 {
            writeln!(out, " Cart discount: -{}", result.cart_discount)
                .map_err(|_err| ReceiptError::Io)?;
        }

        if result.shipping.to_minor_units() > 0 {
            let shipping = if result.free_shipping {
                format!("{} (waived)", result.shipping)
            } else {
                result.shipping.to_string()
            };

            writeln!(out, " Shipping: {shipping}").map_err(|_err| ReceiptError::Io)?;
        }

        writeln!(out, " Total: {}", result.total).map_err(|_err| ReceiptError::Io)?;
        writeln!(out, " Savings: {}", result.savings()?).map_err(|_err| ReceiptError::Io)?;

        if result.points > 0 {
            writeln!(out, " Points earned: {}", result.points).map_err(|_err| ReceiptError::Io)?;
        }

        Ok(())
    }
}
