use crate::domain::customer::Customer;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct CustomerRow<'a> {
    customer: &'a str,
    balance: String,
    entitled_months: u32,
    referred_by: &'a str,
    active: bool,
}

/// Writes the customer report as CSV.
///
/// Columns: `customer,balance,entitled_months,referred_by,active`. Balances are
/// printed without trailing zeros.
pub struct CustomerWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CustomerWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_customers(&mut self, customers: impl IntoIterator<Item = Customer>) -> Result<()> {
        let mut wrote_any = false;
        for customer in customers {
            self.writer.serialize(CustomerRow {
                customer: customer.id.as_str(),
                balance: customer.balance.to_string(),
                entitled_months: customer.entitled_months,
                referred_by: customer.referred_by.as_ref().map_or("", |r| r.as_str()),
                active: customer.is_active(),
            })?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record([
                "customer",
                "balance",
                "entitled_months",
                "referred_by",
                "active",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::customer::CustomerId;
    use crate::domain::money::Balance;
    use rust_decimal_macros::dec;

    fn render(customers: Vec<Customer>) -> String {
        let mut out = Vec::new();
        CustomerWriter::new(&mut out).write_customers(customers).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_report_rows() {
        let mut alice = Customer::new(CustomerId::new("alice"), None);
        alice.credit(Balance::new(dec!(150.00)), 3);
        let mut bob = Customer::new(CustomerId::new("bob"), Some(CustomerId::new("alice")));
        bob.deactivate();

        let out = render(vec![alice, bob]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "customer,balance,entitled_months,referred_by,active");
        assert_eq!(lines[1], "alice,150,3,,true");
        assert_eq!(lines[2], "bob,0,0,alice,false");
    }

    #[test]
    fn test_empty_report_still_has_header() {
        assert_eq!(
            render(Vec::new()).trim_end(),
            "customer,balance,entitled_months,referred_by,active"
        );
    }
}
