pub mod change_record;
pub mod rho_literal;
pub mod rho_term;
