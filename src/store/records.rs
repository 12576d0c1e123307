use crate::error::StoreError;
use crate::model::TouPeriod;
use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub id: i64,
    pub project_id: String,
    pub utility_name: String,
    pub account_number: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterRow {
    pub id: i64,
    pub account_id: i64,
    pub meter_number: String,
    pub meter_key: String,
    pub service_address: Option<String>,
}

/// A bill ready to insert; derived metrics are computed by the caller.
#[derive(Debug, Clone, Default)]
pub struct NewBill {
    pub bill_file_id: i64,
    pub account_id: i64,
    pub meter_id: i64,
    pub utility_name: String,
    pub service_type: String,
    pub service_address: Option<String>,
    pub rate_schedule: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub days_in_period: Option<i64>,
    pub due_date: Option<String>,
    pub total_kwh: Option<f64>,
    pub total_amount_due: Option<f64>,
    pub energy_charges: Option<f64>,
    pub demand_charges: Option<f64>,
    pub max_demand_kw: Option<f64>,
    pub blended_rate: Option<f64>,
    pub avg_cost_per_day: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillRow {
    pub id: i64,
    pub bill_file_id: Option<i64>,
    pub account_id: i64,
    pub meter_id: i64,
    pub service_address: Option<String>,
    pub rate_schedule: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub days_in_period: Option<i64>,
    pub due_date: Option<String>,
    pub total_kwh: Option<f64>,
    pub total_amount_due: Option<f64>,
    pub blended_rate: Option<f64>,
    pub avg_cost_per_day: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TouRow {
    pub period: String,
    pub kwh: f64,
    pub rate: Option<f64>,
    pub est_cost: Option<f64>,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        utility_name: row.get(2)?,
        account_number: row.get(3)?,
    })
}

pub fn find_account(
    conn: &Connection,
    project_id: &str,
    utility_name: &str,
    account_number: &str,
) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id FROM utility_accounts
             WHERE project_id = ?1 AND utility_name = ?2 AND account_number = ?3
             ORDER BY id LIMIT 1",
            params![project_id, utility_name, account_number],
            |row| row.get(0),
        )
        .optional()?)
}

/// Accounts of one utility in a project, oldest first.
pub fn accounts_for_utility(
    conn: &Connection,
    project_id: &str,
    utility_name: &str,
) -> Result<Vec<AccountRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, utility_name, account_number FROM utility_accounts
         WHERE project_id = ?1 AND utility_name = ?2 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![project_id, utility_name], row_to_account)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn accounts_for_project(conn: &Connection, project_id: &str) -> Result<Vec<AccountRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, utility_name, account_number FROM utility_accounts
         WHERE project_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![project_id], row_to_account)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_account(
    conn: &Connection,
    project_id: &str,
    utility_name: &str,
    account_number: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO utility_accounts (project_id, utility_name, account_number) VALUES (?1, ?2, ?3)",
        params![project_id, utility_name, account_number],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move meters and bills from `from` onto `to`, then delete `from`.
pub fn merge_account_into(conn: &Connection, from: i64, to: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE utility_meters SET utility_account_id = ?1 WHERE utility_account_id = ?2",
        params![to, from],
    )?;
    conn.execute(
        "UPDATE bills SET account_id = ?1 WHERE account_id = ?2",
        params![to, from],
    )?;
    conn.execute("DELETE FROM utility_accounts WHERE id = ?1", params![from])?;
    Ok(())
}

/// Delete accounts in the project that own neither meters nor bills.
pub fn delete_empty_accounts(conn: &Connection, project_id: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM utility_accounts
         WHERE project_id = ?1
           AND NOT EXISTS (SELECT 1 FROM utility_meters m WHERE m.utility_account_id = utility_accounts.id)
           AND NOT EXISTS (SELECT 1 FROM bills b WHERE b.account_id = utility_accounts.id)",
        params![project_id],
    )?)
}

// ---------------------------------------------------------------------------
// Meters
// ---------------------------------------------------------------------------

fn row_to_meter(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeterRow> {
    Ok(MeterRow {
        id: row.get(0)?,
        account_id: row.get(1)?,
        meter_number: row.get(2)?,
        meter_key: row.get(3)?,
        service_address: row.get(4)?,
    })
}

/// Oldest meter anywhere in the project with this key.
pub fn find_meter_in_project(
    conn: &Connection,
    project_id: &str,
    meter_key: &str,
) -> Result<Option<MeterRow>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT m.id, m.utility_account_id, m.meter_number, m.meter_key, m.service_address
             FROM utility_meters m JOIN utility_accounts a ON a.id = m.utility_account_id
             WHERE a.project_id = ?1 AND m.meter_key = ?2
             ORDER BY m.id LIMIT 1",
            params![project_id, meter_key],
            row_to_meter,
        )
        .optional()?)
}

pub fn meters_for_account(conn: &Connection, account_id: i64) -> Result<Vec<MeterRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, utility_account_id, meter_number, meter_key, service_address
         FROM utility_meters WHERE utility_account_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![account_id], row_to_meter)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All meters in the project, oldest first.
pub fn meters_for_project(conn: &Connection, project_id: &str) -> Result<Vec<MeterRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.utility_account_id, m.meter_number, m.meter_key, m.service_address
         FROM utility_meters m JOIN utility_accounts a ON a.id = m.utility_account_id
         WHERE a.project_id = ?1 ORDER BY m.id",
    )?;
    let rows = stmt.query_map(params![project_id], row_to_meter)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_meter(
    conn: &Connection,
    account_id: i64,
    meter_number: &str,
    meter_key: &str,
    service_address: Option<&str>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO utility_meters (utility_account_id, meter_number, meter_key, service_address)
         VALUES (?1, ?2, ?3, ?4)",
        params![account_id, meter_number, meter_key, service_address],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fill in a meter's address if it has none yet.
pub fn backfill_meter_address(conn: &Connection, meter_id: i64, address: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE utility_meters SET service_address = ?1 WHERE id = ?2 AND service_address IS NULL",
        params![address, meter_id],
    )?;
    Ok(())
}

/// Repoint `from`'s bills to `to` (and `to`'s account), then delete `from`.
pub fn merge_meter_into(conn: &Connection, from: i64, to: &MeterRow) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE bills SET meter_id = ?1, account_id = ?2 WHERE meter_id = ?3",
        params![to.id, to.account_id, from],
    )?;
    conn.execute("DELETE FROM utility_meters WHERE id = ?1", params![from])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Bills
// ---------------------------------------------------------------------------

pub fn insert_bill(conn: &Connection, bill: &NewBill) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO bills (
            bill_file_id, account_id, meter_id, utility_name, service_type, service_address,
            rate_schedule, period_start, period_end, days_in_period, due_date, total_kwh,
            total_amount_due, energy_charges, demand_charges, max_demand_kw, blended_rate,
            avg_cost_per_day
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            bill.bill_file_id,
            bill.account_id,
            bill.meter_id,
            bill.utility_name,
            bill.service_type,
            bill.service_address,
            bill.rate_schedule,
            bill.period_start,
            bill.period_end,
            bill.days_in_period,
            bill.due_date,
            bill.total_kwh,
            bill.total_amount_due,
            bill.energy_charges,
            bill.demand_charges,
            bill.max_demand_kw,
            bill.blended_rate,
            bill.avg_cost_per_day,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Stores the printed cost, or kWh x rate when none was printed.
pub fn insert_tou_period(conn: &Connection, bill_id: i64, tou: &TouPeriod) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO bill_tou_periods (bill_id, period, kwh, rate_dollars_per_kwh, est_cost_dollars)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![bill_id, tou.period.as_str(), tou.kwh, tou.rate, tou.cost_or_estimate()],
    )?;
    Ok(())
}

/// Delete every bill (and its TOU rows) written from this file.
pub fn delete_bills_for_file(conn: &Connection, file_id: i64) -> Result<usize, StoreError> {
    conn.execute(
        "DELETE FROM bill_tou_periods WHERE bill_id IN (SELECT id FROM bills WHERE bill_file_id = ?1)",
        params![file_id],
    )?;
    Ok(conn.execute("DELETE FROM bills WHERE bill_file_id = ?1", params![file_id])?)
}

const BILL_COLUMNS: &str = "id, bill_file_id, account_id, meter_id, service_address, rate_schedule, \
    period_start, period_end, days_in_period, due_date, total_kwh, total_amount_due, blended_rate, \
    avg_cost_per_day";

fn row_to_bill(row: &rusqlite::Row<'_>) -> rusqlite::Result<BillRow> {
    Ok(BillRow {
        id: row.get(0)?,
        bill_file_id: row.get(1)?,
        account_id: row.get(2)?,
        meter_id: row.get(3)?,
        service_address: row.get(4)?,
        rate_schedule: row.get(5)?,
        period_start: row.get(6)?,
        period_end: row.get(7)?,
        days_in_period: row.get(8)?,
        due_date: row.get(9)?,
        total_kwh: row.get(10)?,
        total_amount_due: row.get(11)?,
        blended_rate: row.get(12)?,
        avg_cost_per_day: row.get(13)?,
    })
}

pub fn bills_for_file(conn: &Connection, file_id: i64) -> Result<Vec<BillRow>, StoreError> {
    let sql = format!("SELECT {BILL_COLUMNS} FROM bills WHERE bill_file_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![file_id], row_to_bill)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn bills_for_meter(conn: &Connection, meter_id: i64) -> Result<Vec<BillRow>, StoreError> {
    let sql = format!("SELECT {BILL_COLUMNS} FROM bills WHERE meter_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![meter_id], row_to_bill)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn tou_for_bill(conn: &Connection, bill_id: i64) -> Result<Vec<TouRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT period, kwh, rate_dollars_per_kwh, est_cost_dollars
         FROM bill_tou_periods WHERE bill_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![bill_id], |row| {
        Ok(TouRow {
            period: row.get(0)?,
            kwh: row.get(1)?,
            rate: row.get(2)?,
            est_cost: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TouPeriodName;
    use crate::store::{Store, files};

    #[test]
    fn test_bill_and_tou_roundtrip_through_delete() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_transaction(|tx| {
                let file = files::register_file(tx, "p", "a.pdf", "/a.pdf", 1)?;
                let acct = insert_account(tx, "p", "LADWP", "123456")?;
                let meter = insert_meter(tx, acct, "APMYV00222-00027735", "0022200027735", None)?;
                let bill = insert_bill(
                    tx,
                    &NewBill {
                        bill_file_id: file,
                        account_id: acct,
                        meter_id: meter,
                        utility_name: "LADWP".to_string(),
                        total_kwh: Some(4200.0),
                        ..NewBill::default()
                    },
                )?;
                insert_tou_period(
                    tx,
                    bill,
                    &TouPeriod {
                        period: TouPeriodName::OffPeak,
                        kwh: 4200.0,
                        rate: Some(0.18),
                        cost: None,
                    },
                )?;

                let tou = tou_for_bill(tx, bill)?;
                assert_eq!(tou[0].period, "Off-Peak");
                assert_eq!(tou[0].est_cost, Some(756.0));

                assert_eq!(delete_bills_for_file(tx, file)?, 1);
                assert!(tou_for_bill(tx, bill)?.is_empty());
                assert_eq!(meters_for_project(tx, "p")?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_empty_accounts_keeps_used_ones() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_transaction(|tx| {
                let used = insert_account(tx, "p", "SCE", "8001053647")?;
                insert_meter(tx, used, "Primary", "PRIMARY", None)?;
                insert_account(tx, "p", "SCE", "999")?;
                assert_eq!(delete_empty_accounts(tx, "p")?, 1);
                assert_eq!(accounts_for_project(tx, "p")?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
